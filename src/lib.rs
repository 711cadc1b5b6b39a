//! # Tremolo
//!
//! Tremoloは、ビームサーチ復号に基づく形態素解析モデルの学習コアです。
//!
//! ## 概要
//!
//! このライブラリは、膠着語の単語分割と品詞タグ付けを同時に学習するための
//! 中核機能を提供します。正解アノテーションは完全（すべての形態素が分割・
//! タグ付けされたもの）でも部分的（一部の切れ目やノード属性のみが制約
//! されたもの）でも構いません。
//!
//! ## 主な機能
//!
//! - **解析ラティス**: 候補ノードと接続アリーナによるラティス表現
//! - **ビームサーチ復号**: trigram構造素性と線形モデルによるスコア計算
//! - **ハッシュドパーセプトロン**: 2のべき乗サイズの重み表を引く線形スコアラー
//! - **部分アノテーション学習**: 制約違反の検出と符号付き疎勾配の組み立て
//! - **SCW学習器**: 損失と勾配を消費するオンライン重み更新
//!
//! ## 使用例
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
//! // 表層・品詞・品詞細分類の3フィールドの辞書
//! let dict = Arc::new(Dictionary::from_reader(
//!     "もも,N,0\nも,PRT,1\n".as_bytes(),
//!     &["surface", "pos", "subpos"],
//! )?);
//!
//! // 部分アノテーション例の読み込み
//! let mut reader = PartialExampleReader::new(Arc::clone(&dict));
//! reader.set_data(",もも,pos:N,subpos:0\n,も,pos:PRT,subpos:1\n,もも,pos:N,subpos:0\n\n");
//! let example = reader.read_example()?.unwrap();
//!
//! // 学習ステップの実行
//! let config = TrainingConfig::default();
//! let templates = FeatureTemplateSet::standard(dict.num_fields());
//! let mut trainer = PartialTrainer::new(Arc::clone(&dict), templates, &config)?;
//! let mut scw = SoftConfidenceWeighted::new(&config);
//!
//! trainer.set_example(example);
//! trainer.prepare()?;
//! trainer.compute(&scw.scorer_def())?;
//! assert!(trainer.loss_value() > 0.0);
//!
//! // 学習器による重み更新
//! scw.update(trainer.loss_value(), trainer.feature_diff());
//! # Ok(())
//! # }
//! ```

#[cfg(not(any(target_pointer_width = "32", target_pointer_width = "64")))]
compile_error!("`target_pointer_width` must be 32 or 64");

/// ビームサーチ解析器とラティス
pub mod analyzer;

/// 学習用のインメモリ辞書
pub mod dictionary;

/// エラー型の定義
pub mod errors;

/// 入力テキストの内部表現
pub mod sentence;

/// 部分アノテーション学習
pub mod trainer;

/// 内部ユーティリティ関数
pub mod utils;

#[cfg(test)]
mod test_utils;
#[cfg(test)]
mod tests;

// Re-exports
pub use analyzer::Analyzer;
pub use dictionary::Dictionary;
pub use trainer::{PartialExampleReader, PartialTrainer, SoftConfidenceWeighted, TrainingConfig};

/// このライブラリのバージョン番号
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
