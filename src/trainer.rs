//! 部分アノテーション学習のためのモジュール。
//!
//! このモジュールは、形態素解析モデルの学習コアを提供します。学習対象の
//! 文には完全なアノテーション（すべての形態素が分割・タグ付けされた
//! もの）も、部分的なアノテーション（一部の切れ目やノード属性のみが
//! 制約されたもの）も使用できます。
//!
//! # 概要
//!
//! - 部分アノテーション例の読み込み（[`PartialExampleReader`]）
//! - ビーム復号結果と正解制約の比較による符号付き疎勾配の組み立て
//!   （[`PartialTrainer`]）
//! - 損失と勾配を消費して重み表を更新するオンライン学習器
//!   （[`SoftConfidenceWeighted`]）
//!
//! # 使用例
//!
//! ```
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//!
//! use tremolo::analyzer::features::FeatureTemplateSet;
//! use tremolo::dictionary::Dictionary;
//! use tremolo::trainer::{PartialExampleReader, PartialTrainer, SoftConfidenceWeighted,
//!                        TrainingConfig};
//!
//! let dict = Arc::new(Dictionary::from_reader(
//!     "もも,N,0\nも,PRT,1\n".as_bytes(),
//!     &["surface", "pos", "subpos"],
//! )?);
//!
//! let mut reader = PartialExampleReader::new(Arc::clone(&dict));
//! reader.set_data(",もも,pos:N,subpos:0\n,も,pos:PRT,subpos:1\n,もも,pos:N,subpos:0\n\n");
//! let example = reader.read_example()?.unwrap();
//!
//! let config = TrainingConfig::default();
//! let templates = FeatureTemplateSet::standard(dict.num_fields());
//! let mut trainer = PartialTrainer::new(Arc::clone(&dict), templates, &config)?;
//! let scw = SoftConfidenceWeighted::new(&config);
//!
//! trainer.set_example(example);
//! trainer.prepare()?;
//! trainer.compute(&scw.scorer_def())?;
//! assert!(trainer.loss_value() > 0.0);
//! # Ok(())
//! # }
//! ```

pub mod example;
pub mod partial;
pub mod scw;

use crate::analyzer::GlobalBeam;

pub use crate::trainer::example::{
    NodeConstraint, PartialExample, PartialExampleReader, TagConstraint,
};
pub use crate::trainer::partial::PartialTrainer;
pub use crate::trainer::scw::SoftConfidenceWeighted;

/// 符号付きスコアを持つ素性
///
/// 学習ステップの出力する疎勾配の1要素です。正のスコアは正解に
/// 適合するN-gram、負のスコアは誤った最良パスのN-gramに対応します。
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScoredFeature {
    /// 素性ハッシュ
    pub feature: u32,
    /// 符号付きスコア
    pub score: f32,
}

/// 学習の設定
///
/// ビーム幅、重み表サイズの指数、グローバルビームを保持します。
#[derive(Clone, Copy, Debug)]
pub struct TrainingConfig {
    pub(crate) beam_size: usize,
    pub(crate) feature_number_exponent: u32,
    pub(crate) global_beam: Option<GlobalBeam>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            beam_size: 5,
            feature_number_exponent: 12,
            global_beam: None,
        }
    }
}

impl TrainingConfig {
    /// ビーム幅を変更します
    ///
    /// デフォルト値は 5 です。
    ///
    /// # パニック
    ///
    /// 値が1未満の場合、パニックします。
    pub fn beam_size(mut self, n: usize) -> Self {
        assert!(n >= 1);
        self.beam_size = n;
        self
    }

    /// 重み表サイズの指数を変更します
    ///
    /// 重み表のサイズは`2^k`になります。デフォルト値は 12 です。
    ///
    /// # パニック
    ///
    /// 値が1未満または31を超える場合、パニックします。
    pub fn feature_number_exponent(mut self, k: u32) -> Self {
        assert!((1..=31).contains(&k));
        self.feature_number_exponent = k;
        self
    }

    /// グローバルビームを設定します
    pub fn global_beam(mut self, left_beam: usize, right_check: usize, right_beam: usize) -> Self {
        self.global_beam = Some(GlobalBeam {
            left_beam,
            right_check,
            right_beam,
        });
        self
    }

    /// 重み表のサイズを返します
    #[inline(always)]
    pub const fn num_features(&self) -> u32 {
        1 << self.feature_number_exponent
    }

    /// 素性ハッシュのマスク（重み表サイズ - 1）を返します
    #[inline(always)]
    pub const fn feature_mask(&self) -> u32 {
        self.num_features() - 1
    }
}
