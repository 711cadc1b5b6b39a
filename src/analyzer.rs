//! ビームサーチ解析器の実装モジュール。
//!
//! このモジュールは、学習コアが依存する解析器を提供します。解析器は
//! 入力文の設定、候補ノードの列挙、ラティス構築、BOS番兵の設置、
//! ビームサーチによるスコア計算を順に実行します。手順を飛ばした呼び出しは
//! 不変条件違反としてエラーになります。
//!
//! スコア計算では境界ごとに、そこで終わるノードのビームエントリを
//! 前方候補として集め、各開始ノードへの接続をN-gram素性とスコアラーで
//! 評価し、スコア上位k件をノードのビームに保持します。同点は挿入順で
//! 解決されます。

pub mod features;
pub mod lattice;
pub mod path;
pub mod perceptron;

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::debug;

use crate::analyzer::features::{
    hash_unk_chars, FeatureTemplateSet, NgramFeatureCalculator, NgramFeatureRef,
};
use crate::analyzer::lattice::{
    BeamEntry, ConnectionPtr, Lattice, LatticeNodePtr, NodeInfo, BOS_ENTRY_VALUE, EOS_ENTRY_VALUE,
};
use crate::analyzer::perceptron::{BoundaryConnection, ScorerDef};
use crate::dictionary::Dictionary;
use crate::errors::{Result, TremoloError};
use crate::sentence::Sentence;

/// 未知語候補の最大グルーピング長
const MAX_UNK_GROUPING: usize = 4;

/// グローバルビームの設定
///
/// 左側は前方候補エントリをスコア上位`left_beam`件に刈り込みます。
/// 右側は、開始ノード数が`right_check`を超える境界で、見積もりスコア
/// 上位`right_beam`件以外のノードを最良の前方候補1件のみで展開します。
#[derive(Clone, Copy, Debug)]
pub struct GlobalBeam {
    /// 前方候補エントリの上限
    pub left_beam: usize,
    /// 右側の刈り込みを発動させる開始ノード数
    pub right_check: usize,
    /// 完全展開する開始ノード数の上限
    pub right_beam: usize,
}

/// 候補ノードのシード
#[derive(Clone, Copy, Debug)]
struct NodeSeed {
    start: u16,
    len: u16,
    entry: u32,
    unk: bool,
}

/// 解析器の進行段階
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
enum Stage {
    Empty,
    Reset,
    Seeded,
    Built,
    Bootstrapped,
    Scored,
}

/// ビームサーチ解析器
///
/// 辞書ビュー、入力文、ラティス、作業バッファを所有します。バッファは
/// 入力間で再利用され、ラティス由来の参照は次の
/// [`reset_for_input`](Self::reset_for_input)で無効になります。
pub struct Analyzer {
    dict: Arc<Dictionary>,
    templates: FeatureTemplateSet,
    sentence: Sentence,
    seeds: Vec<NodeSeed>,
    lattice: Lattice,
    conn_buf: BoundaryConnection,
    score_buf: Vec<f32>,
    cand_buf: Vec<BeamEntry>,
    order_buf: Vec<usize>,
    row_buf: Vec<i32>,
    feat_row: Vec<u32>,
    full_buf: Vec<bool>,
    beam_size: usize,
    global_beam: Option<GlobalBeam>,
    stage: Stage,
}

impl Analyzer {
    /// 新しい解析器を作成します
    ///
    /// # 引数
    ///
    /// * `dict` - 辞書への共有ビュー
    /// * `templates` - N-gram素性テンプレートの集合
    /// * `beam_size` - ビーム幅（1以上）
    ///
    /// # エラー
    ///
    /// ビーム幅が0、またはテンプレートが空の場合、
    /// [`TremoloError`]が返されます。
    pub fn new(
        dict: Arc<Dictionary>,
        templates: FeatureTemplateSet,
        beam_size: usize,
    ) -> Result<Self> {
        if beam_size == 0 {
            return Err(TremoloError::invalid_argument(
                "beam_size",
                "the beam size must be at least 1",
            ));
        }
        if templates.is_empty() {
            return Err(TremoloError::invalid_argument(
                "templates",
                "at least one feature template must be declared",
            ));
        }
        Ok(Self {
            dict,
            templates,
            sentence: Sentence::new(),
            seeds: vec![],
            lattice: Lattice::default(),
            conn_buf: BoundaryConnection::default(),
            score_buf: vec![],
            cand_buf: vec![],
            order_buf: vec![],
            row_buf: vec![],
            feat_row: vec![],
            full_buf: vec![],
            beam_size,
            global_beam: None,
            stage: Stage::Empty,
        })
    }

    /// グローバルビームを設定します
    ///
    /// `None`で無効化します。
    pub fn set_global_beam(&mut self, config: Option<GlobalBeam>) {
        self.global_beam = config;
    }

    /// 解析対象の入力文を設定します
    ///
    /// 以前のラティスとその参照はすべて無効になります。
    ///
    /// # エラー
    ///
    /// 入力が空、または長すぎる場合、[`TremoloError`]が返されます。
    pub fn reset_for_input(&mut self, input: &str) -> Result<()> {
        if input.is_empty() {
            return Err(TremoloError::invalid_argument(
                "input",
                "the input sentence must not be empty",
            ));
        }
        let len = input.chars().count();
        if len + 3 > usize::from(u16::MAX) {
            return Err(TremoloError::invalid_argument(
                "input",
                format!("the input sentence is too long: {len} characters"),
            ));
        }
        self.sentence.set_sentence(input);
        self.stage = Stage::Reset;
        Ok(())
    }

    /// 候補ノードのシードを列挙します
    ///
    /// 各開始位置について辞書の前方一致エントリを集め、辞書に未知語
    /// テンプレートがあれば同じ文字種の連続から未知語候補も生成します。
    pub fn prepare_node_seeds(&mut self) -> Result<()> {
        self.require_stage(Stage::Reset, "prepare_node_seeds")?;
        self.seeds.clear();
        let chars = self.sentence.chars();
        let len = chars.len();
        for start in 0..len {
            for &eid in self.dict.entries_from_char(chars[start]) {
                let entry = self.dict.entry(eid);
                let elen = entry.chars().len();
                if start + elen <= len && &chars[start..start + elen] == entry.chars() {
                    self.seeds.push(NodeSeed {
                        start: start as u16,
                        len: elen as u16,
                        entry: eid,
                        unk: false,
                    });
                }
            }
            if !self.dict.unk_entries().is_empty() {
                let run = self.sentence.run_len(start).min(MAX_UNK_GROUPING);
                for ulen in 1..=run {
                    for &uid in self.dict.unk_entries() {
                        self.seeds.push(NodeSeed {
                            start: start as u16,
                            len: ulen as u16,
                            entry: uid,
                            unk: true,
                        });
                    }
                }
            }
        }
        self.stage = Stage::Seeded;
        Ok(())
    }

    /// シードからラティスを構築します
    ///
    /// 境界を連結し、各ノードのビーム行を確保します。
    ///
    /// # エラー
    ///
    /// どの候補ノードもEOSに到達しない場合、[`TremoloError`]が
    /// 返されます。
    pub fn build_lattice(&mut self) -> Result<()> {
        self.require_stage(Stage::Seeded, "build_lattice")?;
        let len = self.sentence.len_char();
        let num_fields = self.dict.num_fields();
        let eos_boundary = (len + 2) as u16;
        self.lattice.reset(len + 3, num_fields, self.beam_size);

        self.row_buf.clear();
        self.row_buf.resize(num_fields, BOS_ENTRY_VALUE);
        let bos_info = NodeInfo {
            num_codepoints: 1,
            ..Default::default()
        };
        self.lattice.push_node(0, bos_info, &self.row_buf);
        self.lattice.push_node(1, bos_info, &self.row_buf);
        self.lattice.add_end(
            1,
            LatticeNodePtr {
                boundary: 0,
                position: 0,
            },
        );
        self.lattice.add_end(
            2,
            LatticeNodePtr {
                boundary: 1,
                position: 0,
            },
        );

        let chars = self.sentence.chars();
        for seed in &self.seeds {
            let start = usize::from(seed.start);
            let span = &chars[start..start + usize::from(seed.len)];
            let entry = self.dict.entry(seed.entry);
            let boundary = seed.start + 2;
            let info = NodeInfo {
                num_codepoints: seed.len,
                first_char: span[0],
                last_char: span[span.len() - 1],
                first_class: self.sentence.char_class_at(start),
                last_class: self.sentence.char_class_at(start + span.len() - 1),
                numeric: span
                    .iter()
                    .all(|&c| crate::sentence::char_class(c) == crate::sentence::CharClass::Digit),
                longer: seed.unk && seed.len > 1,
            };
            self.row_buf.clear();
            self.row_buf.extend_from_slice(entry.row());
            if seed.unk {
                self.row_buf[0] = hash_unk_chars(span.iter().copied());
            }
            let pos = self.lattice.push_node(boundary, info, &self.row_buf);
            self.lattice.add_end(
                boundary + seed.len,
                LatticeNodePtr {
                    boundary,
                    position: pos,
                },
            );
        }

        self.row_buf.clear();
        self.row_buf.resize(num_fields, EOS_ENTRY_VALUE);
        self.lattice
            .push_node(eos_boundary, NodeInfo::default(), &self.row_buf);

        if self
            .lattice
            .boundary(eos_boundary)
            .ends()
            .node_ptrs()
            .is_empty()
        {
            return Err(TremoloError::invalid_state(
                "cannot build the lattice",
                "no candidate node reaches EOS",
            ));
        }

        self.stage = Stage::Built;
        Ok(())
    }

    /// BOS番兵を設置します
    ///
    /// 接続アリーナの先頭2レコードがBOSの連鎖になり、どのノードからでも
    /// 3つ組が定義されるようになります。
    pub fn bootstrap_analysis(&mut self) -> Result<()> {
        self.require_stage(Stage::Built, "bootstrap_analysis")?;
        install_bos(&mut self.lattice);
        self.stage = Stage::Bootstrapped;
        Ok(())
    }

    /// ビームサーチ復号を実行します
    ///
    /// 境界ごとに前方候補を展開し、各開始ノードのビームをスコア上位で
    /// 埋めます。繰り返し呼び出すたびにビームは初期状態から再計算される
    /// ため、同じ重みに対する結果は決定的です。
    ///
    /// # 引数
    ///
    /// * `sdef` - スコアラー定義
    ///
    /// # エラー
    ///
    /// 手順が守られていない場合や、EOSへ到達する接続が作れなかった
    /// 場合、[`TremoloError`]が返されます。
    pub fn compute_scores(&mut self, sdef: &ScorerDef) -> Result<()> {
        self.require_stage(Stage::Bootstrapped, "compute_scores")?;
        let len = self.sentence.len_char();
        let eos_boundary = (len + 2) as u16;
        let num_templates = self.templates.len();

        install_bos(&mut self.lattice);

        for b in 2..=eos_boundary {
            // Collect the entries of every node ending here.
            self.cand_buf.clear();
            {
                let lattice = &self.lattice;
                for end in lattice.boundary(b).ends().node_ptrs() {
                    let starts = lattice.boundary(end.boundary).starts();
                    for be in starts.beam_row(end.position) {
                        if be.is_fake() {
                            break;
                        }
                        self.cand_buf.push(*be);
                    }
                }
            }
            if self.cand_buf.is_empty() {
                continue;
            }

            let num_starts = self.lattice.boundary(b).starts().num_entries();

            if let Some(gb) = self.global_beam {
                self.cand_buf.sort_by(|x, y| {
                    y.score.partial_cmp(&x.score).unwrap_or(Ordering::Equal)
                });
                self.cand_buf.truncate(gb.left_beam.max(1));
            }

            self.prepare_right_restriction(sdef, b, num_starts, num_templates);

            for p in 0..num_starts {
                let num_cands = if self.full_buf[usize::from(p)] {
                    self.cand_buf.len()
                } else {
                    1
                };

                // Score every candidate connection for this node.
                {
                    let lattice = &self.lattice;
                    let calc = NgramFeatureCalculator::new(lattice, &self.templates);
                    self.conn_buf.reset(num_templates);
                    self.feat_row.resize(num_templates, 0);
                    for cand in &self.cand_buf[..num_cands] {
                        let t1 = lattice.connection(cand.conn);
                        let t2 = lattice.connection(t1.previous);
                        let ngram = NgramFeatureRef {
                            t2: t2.node_ptr(),
                            t1: t1.node_ptr(),
                            t0: LatticeNodePtr {
                                boundary: b,
                                position: p,
                            },
                        };
                        calc.calculate_ngram_features(&ngram, &mut self.feat_row);
                        self.conn_buf.push_row(&self.feat_row);
                    }
                    self.score_buf.clear();
                    self.score_buf.resize(num_cands, 0.0);
                    sdef.scorer
                        .compute(&mut self.score_buf, lattice, b, &self.conn_buf);
                    for (score, cand) in self.score_buf.iter_mut().zip(&self.cand_buf[..num_cands])
                    {
                        *score += cand.score;
                    }
                }

                // Keep the top-k, ties resolved by insertion order.
                self.order_buf.clear();
                self.order_buf.extend(0..num_cands);
                let scores = &self.score_buf;
                self.order_buf.sort_by(|&x, &y| {
                    scores[y].partial_cmp(&scores[x]).unwrap_or(Ordering::Equal)
                });
                self.order_buf.truncate(self.beam_size);

                for slot in 0..self.order_buf.len() {
                    let ci = self.order_buf[slot];
                    let conn = self.lattice.push_connection(ConnectionPtr {
                        boundary: b,
                        right: p,
                        previous: self.cand_buf[ci].conn,
                    });
                    self.lattice.fill_beam_slot(
                        b,
                        p,
                        slot,
                        BeamEntry {
                            conn,
                            score: self.score_buf[ci],
                        },
                    );
                }
            }
        }

        if self
            .lattice
            .boundary(eos_boundary)
            .starts()
            .beam_at(0, 0)
            .is_fake()
        {
            return Err(TremoloError::invalid_state(
                "cannot compute scores",
                "no connection reaches EOS",
            ));
        }

        debug!(
            boundaries = self.lattice.created_boundary_count(),
            connections = self.lattice.num_connections(),
            "beam decoding finished"
        );
        self.stage = Stage::Scored;
        Ok(())
    }

    /// 右側グローバルビームの展開制限を計算します
    ///
    /// 制限対象外のノード、または制限が無効な場合はすべて完全展開です。
    fn prepare_right_restriction(
        &mut self,
        sdef: &ScorerDef,
        b: u16,
        num_starts: u16,
        num_templates: usize,
    ) {
        self.full_buf.clear();
        self.full_buf.resize(usize::from(num_starts), true);
        let Some(gb) = self.global_beam else {
            return;
        };
        if usize::from(num_starts) <= gb.right_check || self.cand_buf.is_empty() {
            return;
        }

        // Estimate each node with the best leading candidate only.
        {
            let lattice = &self.lattice;
            let calc = NgramFeatureCalculator::new(lattice, &self.templates);
            let best = self.cand_buf[0];
            let t1 = lattice.connection(best.conn);
            let t2 = lattice.connection(t1.previous);
            self.conn_buf.reset(num_templates);
            self.feat_row.resize(num_templates, 0);
            for p in 0..num_starts {
                let ngram = NgramFeatureRef {
                    t2: t2.node_ptr(),
                    t1: t1.node_ptr(),
                    t0: LatticeNodePtr {
                        boundary: b,
                        position: p,
                    },
                };
                calc.calculate_ngram_features(&ngram, &mut self.feat_row);
                self.conn_buf.push_row(&self.feat_row);
            }
            self.score_buf.clear();
            self.score_buf.resize(usize::from(num_starts), 0.0);
            sdef.scorer
                .compute(&mut self.score_buf, lattice, b, &self.conn_buf);
        }

        self.order_buf.clear();
        self.order_buf.extend(0..usize::from(num_starts));
        let scores = &self.score_buf;
        self.order_buf
            .sort_by(|&x, &y| scores[y].partial_cmp(&scores[x]).unwrap_or(Ordering::Equal));
        self.full_buf.fill(false);
        for &p in self.order_buf.iter().take(gb.right_beam.max(1)) {
            self.full_buf[p] = true;
        }
    }

    /// ラティスへの参照を返します
    #[inline(always)]
    pub fn lattice(&self) -> &Lattice {
        &self.lattice
    }

    /// テンプレート集合への参照を返します
    #[inline(always)]
    pub fn templates(&self) -> &FeatureTemplateSet {
        &self.templates
    }

    /// 辞書への参照を返します
    #[inline(always)]
    pub fn dictionary(&self) -> &Dictionary {
        &self.dict
    }

    /// 入力文への参照を返します
    #[inline(always)]
    pub fn sentence(&self) -> &Sentence {
        &self.sentence
    }

    /// 最良パスの内容ノードを文頭側から順に返します
    ///
    /// # エラー
    ///
    /// スコア計算が済んでいない場合、[`TremoloError`]が返されます。
    pub fn top1_node_ptrs(&self) -> Result<Vec<LatticeNodePtr>> {
        let eos_boundary = self.lattice.created_boundary_count() - 1;
        let top = self.lattice.boundary(eos_boundary).starts().beam_at(0, 0);
        if top.is_fake() {
            return Err(TremoloError::invalid_state(
                "cannot walk the analysis result",
                "scores were not computed",
            ));
        }
        let mut nodes = vec![];
        let mut cur = self.lattice.connection(top.conn);
        loop {
            let prev = self.lattice.connection(cur.previous);
            if prev.boundary <= 1 {
                break;
            }
            nodes.push(prev.node_ptr());
            cur = prev;
        }
        nodes.reverse();
        Ok(nodes)
    }

    /// 指定ノードの表層文字列を返します
    pub fn node_surface(&self, ptr: LatticeNodePtr) -> String {
        let start = usize::from(ptr.boundary) - 2;
        let len = usize::from(
            self.lattice
                .boundary(ptr.boundary)
                .starts()
                .node_info(ptr.position)
                .num_codepoints,
        );
        self.sentence.chars()[start..start + len].iter().collect()
    }

    fn require_stage(&self, at_least: Stage, op: &str) -> Result<()> {
        if self.stage < at_least {
            return Err(TremoloError::invalid_state(
                format!("cannot run {op}"),
                format!("the analyzer is at stage {:?}", self.stage),
            ));
        }
        Ok(())
    }
}

/// BOS番兵をアリーナとビームへ設置します
///
/// アリーナ添字0はそれ自身を指すため、3つ組の復元はBOSで止まります。
fn install_bos(lattice: &mut Lattice) {
    lattice.clear_connections();
    let c0 = lattice.push_connection(ConnectionPtr {
        boundary: 0,
        right: 0,
        previous: 0,
    });
    let c1 = lattice.push_connection(ConnectionPtr {
        boundary: 1,
        right: 0,
        previous: c0,
    });
    lattice.fill_beam_slot(0, 0, 0, BeamEntry { conn: c0, score: 0.0 });
    lattice.fill_beam_slot(1, 0, 0, BeamEntry { conn: c1, score: 0.0 });
}
