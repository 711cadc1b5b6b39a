//! Soft Confidence-Weightedオンライン学習器のモジュール。
//!
//! このモジュールは、学習ステップの出力する（損失, 疎勾配）を消費して
//! ハッシュドパーセプトロンの重み表をその場で更新する学習器を
//! 提供します。平均ベクトルが重み表そのもので、対角共分散が素性ごとの
//! 更新幅を制御します。繰り返し更新された素性ほど分散が縮み、更新が
//! 保守的になります。
//!
//! スコアリング中は共有の読み取り専用ビューを使用し、重みの変更は
//! ステップ間でのみ行われます。

use crate::analyzer::perceptron::{HashedFeaturePerceptron, ScorerDef};
use crate::trainer::{ScoredFeature, TrainingConfig};
use crate::utils::FromU32;

/// 信頼度0.9に対応するプロビット値
const DEFAULT_PHI: f64 = 1.2815515655446004;

/// Soft Confidence-Weighted学習器
///
/// SCW-Iの更新則を対角共分散で実装します。
pub struct SoftConfidenceWeighted {
    perceptron: HashedFeaturePerceptron,
    sigma: Vec<f32>,
    c: f64,
    phi: f64,
}

impl SoftConfidenceWeighted {
    /// 新しい学習器を作成します
    ///
    /// 重み表は0で、共分散は1で初期化されます。
    ///
    /// # 引数
    ///
    /// * `config` - 学習の設定（重み表サイズの指数を使用）
    pub fn new(config: &TrainingConfig) -> Self {
        let perceptron = HashedFeaturePerceptron::new(config.feature_number_exponent);
        let sigma = vec![1.0; perceptron.num_weights()];
        Self {
            perceptron,
            sigma,
            c: 1.0,
            phi: DEFAULT_PHI,
        }
    }

    /// 正則化パラメータCを変更します
    ///
    /// デフォルト値は 1.0 です。
    ///
    /// # パニック
    ///
    /// 値が0以下の場合、パニックします。
    pub fn regularization(mut self, c: f64) -> Self {
        assert!(c > 0.0);
        self.c = c;
        self
    }

    /// 信頼度パラメータφを変更します
    ///
    /// デフォルト値は信頼度0.9に対応するプロビット値です。
    ///
    /// # パニック
    ///
    /// 値が0以下の場合、パニックします。
    pub fn confidence(mut self, phi: f64) -> Self {
        assert!(phi > 0.0);
        self.phi = phi;
        self
    }

    /// スコアラー定義を返します
    ///
    /// 解析器へ渡す読み取り専用ビューです。
    #[inline(always)]
    pub fn scorer_def(&self) -> ScorerDef<'_> {
        ScorerDef {
            scorer: &self.perceptron,
        }
    }

    /// 内部のパーセプトロンへの参照を返します
    #[inline(always)]
    pub fn perceptron(&self) -> &HashedFeaturePerceptron {
        &self.perceptron
    }

    /// 重み表を更新します
    ///
    /// 勾配の方向への余裕（マージン）が不足している場合のみ重みを
    /// 動かします。損失が0の場合は何もしません。
    ///
    /// # 引数
    ///
    /// * `loss` - 学習ステップの損失
    /// * `features` - 学習ステップの素性勾配（マスク済み）
    pub fn update(&mut self, loss: f32, features: &[ScoredFeature]) {
        if loss <= 0.0 || features.is_empty() {
            return;
        }
        let Self {
            perceptron, sigma, ..
        } = self;
        let mask = perceptron.mask();

        let mut margin = 0f64;
        let mut variance = 0f64;
        for f in features {
            let i = usize::from_u32(f.feature & mask);
            let x = f64::from(f.score);
            margin += f64::from(perceptron.weight(f.feature)) * x;
            variance += f64::from(sigma[i]) * x * x;
        }
        if variance <= 0.0 {
            return;
        }

        let phi = self.phi;
        let zeta = 1.0 + phi * phi;
        let psi = 1.0 + phi * phi / 2.0;
        let alpha = ((-margin * psi
            + (margin * margin * phi.powi(4) / 4.0 + variance * phi * phi * zeta).sqrt())
            / (variance * zeta))
            .clamp(0.0, self.c);
        if alpha <= 0.0 {
            return;
        }
        let avp = alpha * variance * phi;
        let sqrt_u = (-avp + (avp * avp + 4.0 * variance).sqrt()) / 2.0;
        let beta = alpha * phi / (sqrt_u + variance * alpha * phi);

        let weights = perceptron.weights_mut();
        for f in features {
            let i = usize::from_u32(f.feature & mask);
            let s = f64::from(sigma[i]);
            let x = f64::from(f.score);
            weights[i] += (alpha * s * x) as f32;
            // keep the variance positive
            sigma[i] = (s - beta * s * s * x * x).max(1e-6) as f32;
        }
    }
}
