//! テスト用ユーティリティ
//!
//! テストコードで使用する辞書・学習器の構築ヘルパーを提供します。

use std::sync::Arc;

use crate::analyzer::features::FeatureTemplateSet;
use crate::analyzer::Analyzer;
use crate::dictionary::Dictionary;
use crate::trainer::{
    PartialExample, PartialExampleReader, PartialTrainer, SoftConfidenceWeighted, TrainingConfig,
};

/// 表層・品詞・品詞細分類の3フィールドの辞書を構築します
pub(crate) fn build_dict(data: &str) -> Arc<Dictionary> {
    Arc::new(Dictionary::from_reader(data.as_bytes(), &["surface", "pos", "subpos"]).unwrap())
}

/// 最初のレコードを部分アノテーション例として読み込みます
pub(crate) fn read_one(dict: &Arc<Dictionary>, text: &str) -> PartialExample {
    let mut reader = PartialExampleReader::new(Arc::clone(dict));
    reader.set_data(text);
    reader.read_example().unwrap().unwrap()
}

/// 標準テンプレートの学習ステップを構築します
pub(crate) fn make_trainer(dict: &Arc<Dictionary>, config: &TrainingConfig) -> PartialTrainer {
    let templates = FeatureTemplateSet::standard(dict.num_fields());
    PartialTrainer::new(Arc::clone(dict), templates, config).unwrap()
}

/// 標準テンプレートの解析器を構築します
pub(crate) fn make_analyzer(dict: &Arc<Dictionary>, config: &TrainingConfig) -> Analyzer {
    let templates = FeatureTemplateSet::standard(dict.num_fields());
    Analyzer::new(Arc::clone(dict), templates, config.beam_size).unwrap()
}

/// 損失が0になるまで学習を繰り返します
///
/// # 戻り値
///
/// 損失が0に達するまでに行った更新回数
///
/// # パニック
///
/// `max_updates`回の更新でも損失が0にならない場合、パニックします。
pub(crate) fn train_until_converged(
    trainer: &mut PartialTrainer,
    scw: &mut SoftConfidenceWeighted,
    max_updates: usize,
) -> usize {
    for updates in 0..=max_updates {
        trainer.compute(&scw.scorer_def()).unwrap();
        let loss = trainer.loss_value();
        assert_eq!(loss == 0.0, trainer.feature_diff().is_empty());
        if loss == 0.0 {
            return updates;
        }
        scw.update(loss, trainer.feature_diff());
    }
    panic!("the loss did not reach zero after {max_updates} updates");
}

/// 最良パスを（表層, 品詞, 品詞細分類）の列として取り出します
pub(crate) fn top1_tokens(analyzer: &Analyzer) -> Vec<(String, String, String)> {
    let dict = analyzer.dictionary();
    let pos_field = dict.field("pos").unwrap();
    let subpos_field = dict.field("subpos").unwrap();
    analyzer
        .top1_node_ptrs()
        .unwrap()
        .into_iter()
        .map(|ptr| {
            let row = analyzer
                .lattice()
                .boundary(ptr.boundary)
                .starts()
                .entry_row(ptr.position);
            (
                analyzer.node_surface(ptr),
                pos_field.value_str(row[1]).unwrap_or("?").to_string(),
                subpos_field.value_str(row[2]).unwrap_or("?").to_string(),
            )
        })
        .collect()
}

/// トークン列の表層だけを取り出します
pub(crate) fn surfaces(tokens: &[(String, String, String)]) -> Vec<&str> {
    tokens.iter().map(|t| t.0.as_str()).collect()
}
