//! ハッシュ素性に基づく線形スコアラーのモジュール。
//!
//! このモジュールは、素性ハッシュをマスクして重み表を引く
//! ハッシュドパーセプトロンと、解析器が依存するスコアラーの
//! 能力インタフェースを提供します。

use crate::analyzer::lattice::Lattice;
use crate::errors::{Result, TremoloError};
use crate::utils::FromU32;

/// 1境界分の接続素性バッファ
///
/// 復号中の1つの境界について、候補接続ごとに1行のN-gram素性列を
/// 保持します。行幅はテンプレート数と一致します。バッファは境界間で
/// 再利用されます。
#[derive(Default)]
pub struct BoundaryConnection {
    features: Vec<u32>,
    row_len: usize,
}

impl BoundaryConnection {
    /// バッファをクリアし、行幅を設定します
    ///
    /// # 引数
    ///
    /// * `row_len` - 1行あたりの素性数（テンプレート数）
    pub fn reset(&mut self, row_len: usize) {
        self.features.clear();
        self.row_len = row_len;
    }

    /// 1行分の素性列を追加します
    pub fn push_row(&mut self, row: &[u32]) {
        debug_assert_eq!(row.len(), self.row_len);
        self.features.extend_from_slice(row);
    }

    /// 行数を返します
    #[inline(always)]
    pub fn num_rows(&self) -> usize {
        if self.row_len == 0 {
            0
        } else {
            self.features.len() / self.row_len
        }
    }

    /// 指定行の素性列を返します
    #[inline(always)]
    pub fn row(&self, i: usize) -> &[u32] {
        &self.features[i * self.row_len..(i + 1) * self.row_len]
    }
}

/// スコアラーの能力インタフェース
///
/// 解析器は復号中、境界ごとにこのインタフェースを通じて候補接続の
/// スコアを要求します。スコアリング中、実装は読み取り専用です。
pub trait Scorer {
    /// 候補接続ごとのスコアを計算します
    ///
    /// `scores`の長さは`connection`の行数と一致しなければなりません。
    ///
    /// # 引数
    ///
    /// * `scores` - 行ごとのスコアの出力先
    /// * `lattice` - 対象のラティス
    /// * `boundary` - 注目している境界
    /// * `connection` - 境界の接続素性バッファ
    fn compute(
        &self,
        scores: &mut [f32],
        lattice: &Lattice,
        boundary: u16,
        connection: &BoundaryConnection,
    );

    /// 永続化されたモデルから重みを読み込みます
    fn load(&mut self, model: &[u8]) -> Result<()>;
}

/// スコアラー定義
///
/// 学習ステップへ渡されるスコアラーへの共有ビューです。
pub struct ScorerDef<'a> {
    /// スコア計算に使用するスコアラー
    pub scorer: &'a dyn Scorer,
}

/// ハッシュドパーセプトロン
///
/// サイズが2のべき乗の平坦な重み表を保持します。素性ハッシュは
/// `mask = size - 1`でマスクされ、1行のスコアはマスク後の重みの
/// 総和です。
pub struct HashedFeaturePerceptron {
    weights: Vec<f32>,
    mask: u32,
}

impl HashedFeaturePerceptron {
    /// 2^exponent個の重みを持つパーセプトロンを作成します
    ///
    /// # 引数
    ///
    /// * `exponent` - 重み表サイズの指数（1以上31以下）
    ///
    /// # パニック
    ///
    /// 指数が範囲外の場合、パニックします。
    pub fn new(exponent: u32) -> Self {
        assert!((1..=31).contains(&exponent));
        let size = 1usize << exponent;
        Self {
            weights: vec![0.0; size],
            mask: (size - 1) as u32,
        }
    }

    /// 既存の重みベクトルからパーセプトロンを作成します
    ///
    /// # エラー
    ///
    /// 重み数が2のべき乗でない場合、[`TremoloError`]が返されます。
    pub fn from_weights(weights: Vec<f32>) -> Result<Self> {
        if weights.is_empty() || !weights.len().is_power_of_two() {
            return Err(TremoloError::invalid_argument(
                "weights",
                "the number of weights must be a power of two",
            ));
        }
        let mask = (weights.len() - 1) as u32;
        Ok(Self { weights, mask })
    }

    /// 重み数を返します
    #[inline(always)]
    pub fn num_weights(&self) -> usize {
        self.weights.len()
    }

    /// ハッシュマスク（重み数 - 1）を返します
    #[inline(always)]
    pub fn mask(&self) -> u32 {
        self.mask
    }

    /// 指定ハッシュの重みを返します
    #[inline(always)]
    pub fn weight(&self, feature: u32) -> f32 {
        self.weights[usize::from_u32(feature & self.mask)]
    }

    pub(crate) fn weights_mut(&mut self) -> &mut [f32] {
        &mut self.weights
    }
}

impl Scorer for HashedFeaturePerceptron {
    fn compute(
        &self,
        scores: &mut [f32],
        _lattice: &Lattice,
        _boundary: u16,
        connection: &BoundaryConnection,
    ) {
        debug_assert!(self.weights.len().is_power_of_two());
        debug_assert_eq!(scores.len(), connection.num_rows());
        for (i, score) in scores.iter_mut().enumerate() {
            *score = connection
                .row(i)
                .iter()
                .map(|&h| self.weights[usize::from_u32(h & self.mask)])
                .sum();
        }
    }

    fn load(&mut self, _model: &[u8]) -> Result<()> {
        Err(TremoloError::NotImplemented(
            "loading a persisted scorer model",
        ))
    }
}
