//! 最良パスの巡回モジュール。
//!
//! このモジュールは、復号済みラティスのEOSビーム先頭から最良パスを
//! 復元し、前向き・境界単位の反復を提供する巡回器を実装します。

use crate::analyzer::lattice::{ConnectionPtr, Lattice};
use crate::errors::{Result, TremoloError};

/// 最良パスの巡回器
///
/// EOSビームの先頭スロットから初期化され、パス上の接続を保持します。
/// `reset`と`move_to_boundary`は純粋な状態遷移で、ラティスを変更しません。
/// 保持する接続は次の`reset_for_input`まで有効です。
#[derive(Default)]
pub struct AnalysisPath {
    /// BOS側からEOS側の順に並んだ、パス上の内容ノードの接続
    path: Vec<ConnectionPtr>,
    /// EOSノードの接続
    eos: ConnectionPtr,
    cursor: usize,
    target: u16,
}

impl AnalysisPath {
    /// 復号済みラティスからパスを取り込みます
    ///
    /// # エラー
    ///
    /// EOSビームが空の場合（スコア計算前、または連結していない
    /// ラティス）、[`TremoloError`]が返されます。
    pub fn fill_in(&mut self, lattice: &Lattice) -> Result<()> {
        let eos_boundary = lattice.created_boundary_count() - 1;
        let top = lattice.boundary(eos_boundary).starts().beam_at(0, 0);
        if top.is_fake() {
            return Err(TremoloError::invalid_state(
                "cannot fill in the analysis path",
                "the EOS beam is empty; scores were not computed",
            ));
        }
        self.eos = lattice.connection(top.conn);
        self.path.clear();
        let mut cur = self.eos;
        loop {
            let prev = lattice.connection(cur.previous);
            if prev.boundary <= 1 {
                break;
            }
            self.path.push(prev);
            cur = prev;
        }
        self.path.reverse();
        self.reset();
        Ok(())
    }

    /// EOSノードの接続を返します
    #[inline(always)]
    pub fn eos_ptr(&self) -> ConnectionPtr {
        self.eos
    }

    /// パス上の内容ノード数を返します
    ///
    /// BOS・EOSの番兵は数えません。
    #[inline(always)]
    pub fn total_nodes(&self) -> usize {
        self.path.len()
    }

    /// カーソルをパスの先頭へ戻します
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.target = u16::MAX;
    }

    /// カーソルを指定境界に位置づけます
    ///
    /// 以降の`next_node`は、この境界から始まるパス上の接続を返します。
    ///
    /// # 戻り値
    ///
    /// パス上に該当境界のノードが存在すれば`true`
    pub fn move_to_boundary(&mut self, boundary: u16) -> bool {
        match self.path.iter().position(|c| c.boundary == boundary) {
            Some(i) => {
                self.cursor = i;
                self.target = boundary;
                true
            }
            None => false,
        }
    }

    /// 現在の境界の次の接続を返します
    ///
    /// 対象境界の接続をすべて返し終えると`None`を返します。
    pub fn next_node(&mut self) -> Option<ConnectionPtr> {
        if self.cursor < self.path.len() && self.path[self.cursor].boundary == self.target {
            let ptr = self.path[self.cursor];
            self.cursor += 1;
            Some(ptr)
        } else {
            None
        }
    }

    /// パス上の接続をBOS側からEOS側の順で返します
    #[inline(always)]
    pub fn nodes(&self) -> &[ConnectionPtr] {
        &self.path
    }
}
