//! 部分アノテーション学習ステップの実装モジュール。
//!
//! このモジュールは、ビーム復号の最良パスを正解制約と比較し、
//! 符号付きの疎な素性勾配とスカラー損失を組み立てる学習ステップを
//! 提供します。
//!
//! 比較は3段階で行われます。
//!
//! 1. 境界制約 - 最良パスをEOSから後ろ向きに歩き、正解の切れ目が
//!    ノードの内部に落ちていないかを調べます。
//! 2. タグ制約 - 各ノード制約の境界にある最良パスのノードについて、
//!    長さとタグフィールドの一致を調べます。
//! 3. EOS - 最後の内容ノードが正解と両立するかを調べます。
//!
//! 違反ごとに、正解に適合する候補のN-gramへ正のスコア、誤った
//! 最良パスのN-gramへ負のスコアが追加されます。勾配は最後にマスク・
//! 整列・合算されます。

use std::sync::Arc;

use tracing::trace;

use crate::analyzer::features::{FeatureTemplateSet, NgramFeatureCalculator, NgramFeatureRef};
use crate::analyzer::lattice::{ConnectionPtr, LatticeNodePtr};
use crate::analyzer::path::AnalysisPath;
use crate::analyzer::perceptron::ScorerDef;
use crate::analyzer::Analyzer;
use crate::dictionary::Dictionary;
use crate::errors::Result;
use crate::trainer::example::PartialExample;
use crate::trainer::{ScoredFeature, TrainingConfig};

/// 境界制約違反の記録
#[derive(Clone, Copy)]
struct BoundaryViolation {
    node: ConnectionPtr,
    boundary: i32,
    prev_boundary: i32,
}

/// タグ制約違反の記録
#[derive(Clone, Copy)]
struct TagViolation {
    node: ConnectionPtr,
    constraint: usize,
}

/// 部分アノテーション学習ステップ
///
/// 解析器とラティスを排他的に所有します。素性バッファと最良パス
/// 巡回器はステップ間で再利用されます。
pub struct PartialTrainer {
    analyzer: Analyzer,
    example: PartialExample,
    top1: AnalysisPath,
    features: Vec<ScoredFeature>,
    feature_buf: Vec<u32>,
    boundary_violations: Vec<BoundaryViolation>,
    tag_violations: Vec<TagViolation>,
    mask: u32,
    loss: f32,
}

impl PartialTrainer {
    /// 新しい学習ステップを作成します
    ///
    /// # 引数
    ///
    /// * `dict` - 辞書への共有ビュー
    /// * `templates` - N-gram素性テンプレートの集合
    /// * `config` - 学習の設定
    ///
    /// # エラー
    ///
    /// 解析器の構築に失敗した場合、[`TremoloError`](crate::errors::TremoloError)が
    /// 返されます。
    pub fn new(
        dict: Arc<Dictionary>,
        templates: FeatureTemplateSet,
        config: &TrainingConfig,
    ) -> Result<Self> {
        let mut analyzer = Analyzer::new(dict, templates, config.beam_size)?;
        analyzer.set_global_beam(config.global_beam);
        Ok(Self {
            analyzer,
            example: PartialExample::default(),
            top1: AnalysisPath::default(),
            features: vec![],
            feature_buf: vec![],
            boundary_violations: vec![],
            tag_violations: vec![],
            mask: config.feature_mask(),
            loss: 0.0,
        })
    }

    /// 学習対象の例を設定します
    pub fn set_example(&mut self, example: PartialExample) {
        self.example = example;
    }

    /// 現在の例への参照を返します
    #[inline(always)]
    pub fn example(&self) -> &PartialExample {
        &self.example
    }

    /// 内部の解析器への参照を返します
    #[inline(always)]
    pub fn analyzer(&self) -> &Analyzer {
        &self.analyzer
    }

    /// 現在の損失を返します
    #[inline(always)]
    pub fn loss_value(&self) -> f32 {
        self.loss
    }

    /// 素性勾配を返します
    ///
    /// [`compute`](Self::compute)の成功後、ハッシュは狭義単調増加で
    /// 重複はありません。
    #[inline(always)]
    pub fn feature_diff(&self) -> &[ScoredFeature] {
        &self.features
    }

    /// 解析器を例の表層で初期化します
    ///
    /// 入力の設定、候補列挙、ラティス構築、BOS設置を順に実行します。
    /// 各段階のエラーはそのまま伝播します。
    pub fn prepare(&mut self) -> Result<()> {
        let Self {
            analyzer, example, ..
        } = self;
        analyzer.reset_for_input(example.surface())?;
        analyzer.prepare_node_seeds()?;
        analyzer.build_lattice()?;
        analyzer.bootstrap_analysis()?;
        Ok(())
    }

    /// スコアを計算し、勾配と損失を組み立てます
    ///
    /// 同じスコアラーでの連続した呼び出しは同一の勾配と損失を
    /// 生成します。失敗した場合、勾配と損失は呼び出し側で破棄
    /// されるべき途中状態になります。
    pub fn compute(&mut self, sdef: &ScorerDef) -> Result<()> {
        self.analyzer.compute_scores(sdef)?;
        {
            let Self { analyzer, top1, .. } = self;
            top1.fill_in(analyzer.lattice())?;
        }
        self.features.clear();
        self.loss = 0.0;
        self.handle_boundary_constraints();
        self.handle_tag_constraints();
        self.handle_eos();
        self.finalize_features();
        Ok(())
    }

    /// 正解に適合するすべてのラティスノードを列挙します
    ///
    /// # 引数
    ///
    /// * `callback` - 適合ノードごとに呼ばれるコールバック
    pub fn mark_gold<F>(&self, mut callback: F)
    where
        F: FnMut(LatticeNodePtr),
    {
        let lattice = self.analyzer.lattice();
        for boundary in 0..lattice.created_boundary_count() {
            let starts = lattice.boundary(boundary).starts();
            for position in 0..starts.num_entries() {
                if self.example.does_node_match(starts, boundary, position) {
                    callback(LatticeNodePtr { boundary, position });
                }
            }
        }
    }

    /// 最良パスをEOSから後ろ向きに歩き、正解の切れ目と突き合わせます
    ///
    /// 正解の切れ目がパス上のノードの内部に落ちていたら違反です。
    fn handle_boundary_constraints(&mut self) {
        self.boundary_violations.clear();
        {
            let Self {
                analyzer,
                example,
                top1,
                boundary_violations,
                loss,
                ..
            } = self;
            let lattice = analyzer.lattice();
            let eos_boundary = lattice.created_boundary_count() - 1;
            let top = lattice.boundary(eos_boundary).starts().beam_at(0, 0);
            let mut node_end = lattice.connection(top.conn);
            let mut node_start = lattice.connection(node_end.previous);
            let bounds = example.boundaries();
            let mut i = bounds.len();
            let total = top1.total_nodes() as f32;
            while node_start.boundary > 1 && i > 0 {
                let cut = bounds[i - 1];
                let start_b = i32::from(node_start.boundary);
                let end_b = i32::from(node_end.boundary);
                if start_b == cut {
                    // boundaries match, GOOD!
                    i -= 1;
                    node_end = node_start;
                    node_start = lattice.connection(node_end.previous);
                } else if start_b < cut && cut < end_b {
                    // BAD: the gold cut falls inside this node
                    let next_cut = if i >= 2 { bounds[i - 2] } else { 2 };
                    boundary_violations.push(BoundaryViolation {
                        node: node_start,
                        boundary: cut,
                        prev_boundary: next_cut,
                    });
                    *loss += 1.0 / total;
                    i -= 1;
                } else if cut >= end_b {
                    // the cut lies after the node, move the cut
                    i -= 1;
                } else {
                    // the cut lies before the node, move the node
                    node_end = node_start;
                    node_start = lattice.connection(node_end.previous);
                }
            }
        }
        for i in 0..self.boundary_violations.len() {
            let v = self.boundary_violations[i];
            self.add_bad_node(v.node, v.boundary, v.prev_boundary);
        }
    }

    /// 切れ目を守る候補に正、違反ノードに負の素性を追加します
    ///
    /// 境界`boundary`でちょうど終わる（＝切れ目を守る）各候補ノードの
    /// ビームエントリの3つ組へ正のスコアを、違反ノードの3つ組へ
    /// 釣り合う負のスコアを追加します。
    fn add_bad_node(&mut self, node: ConnectionPtr, boundary: i32, prev_boundary: i32) {
        let Self {
            analyzer,
            features,
            feature_buf,
            ..
        } = self;
        let lattice = analyzer.lattice();
        let calc = NgramFeatureCalculator::new(lattice, analyzer.templates());
        let good_boundary = lattice.boundary(boundary as u16);
        let ending_nodes = good_boundary.ends().node_ptrs();
        let row_size = lattice.beam_width();
        let score = 1.0 / (ending_nodes.len() * row_size) as f32;
        let mut count = 0i32;

        trace!(boundary, "adding boundary-constraint features");
        feature_buf.resize(analyzer.templates().len(), 0);

        for end in ending_nodes {
            // a node spanning through the previous gold cut is incorrect, forbid it
            if i32::from(end.boundary) < prev_boundary {
                continue;
            }
            let starts = lattice.boundary(end.boundary).starts();
            for entry in starts.beam_row(end.position) {
                if entry.is_fake() {
                    continue;
                }
                let t0 = lattice.connection(entry.conn);
                if t0 == node {
                    continue;
                }
                let t1 = lattice.connection(t0.previous);
                let t2 = lattice.connection(t1.previous);
                calc.calculate_ngram_features(
                    &NgramFeatureRef {
                        t2: t2.node_ptr(),
                        t1: t1.node_ptr(),
                        t0: t0.node_ptr(),
                    },
                    feature_buf,
                );
                count += 1;
                for &f in feature_buf.iter() {
                    features.push(ScoredFeature { feature: f, score });
                }
            }
        }

        {
            let t1 = lattice.connection(node.previous);
            let t2 = lattice.connection(t1.previous);
            calc.calculate_ngram_features(
                &NgramFeatureRef {
                    t2: t2.node_ptr(),
                    t1: t1.node_ptr(),
                    t0: node.node_ptr(),
                },
                feature_buf,
            );
            let negative = -(count as f32) * score;
            for &f in feature_buf.iter() {
                features.push(ScoredFeature {
                    feature: f,
                    score: negative,
                });
            }
        }
    }

    /// ノード制約の境界にある最良パスのノードを検査します
    ///
    /// 長さまたはタグが一致しないノードは違反として記録されます。
    /// 制約の境界にパスのノードが無い場合は境界制約が処理済みです。
    fn handle_tag_constraints(&mut self) {
        self.tag_violations.clear();
        let node_ratio = 1.0 / self.top1.total_nodes() as f32;
        {
            let Self {
                analyzer,
                example,
                top1,
                tag_violations,
                ..
            } = self;
            let lattice = analyzer.lattice();
            top1.reset();
            for (ci, nc) in example.nodes().iter().enumerate() {
                let Ok(target) = u16::try_from(nc.boundary) else {
                    continue;
                };
                if !top1.move_to_boundary(target) {
                    // nothing of the top-1 path starts here;
                    // the boundary handler covers this case
                    continue;
                }
                while let Some(ptr) = top1.next_node() {
                    let starts = lattice.boundary(ptr.boundary).starts();
                    let info = starts.node_info(ptr.right);
                    if i32::from(info.num_codepoints) != nc.length {
                        tag_violations.push(TagViolation {
                            node: ptr,
                            constraint: ci,
                        });
                        continue;
                    }
                    let row = starts.entry_row(ptr.right);
                    for tag in &nc.tags {
                        if row[usize::from(tag.field)] != tag.value {
                            tag_violations.push(TagViolation {
                                node: ptr,
                                constraint: ci,
                            });
                            break;
                        }
                    }
                }
            }
        }
        for i in 0..self.tag_violations.len() {
            let v = self.tag_violations[i];
            let contribution = self.add_bad_node2(v.node, v.constraint);
            self.loss += node_ratio * contribution;
        }
    }

    /// 制約に適合する候補へ正、違反ノードへ負の素性を追加します
    ///
    /// 同じ境界で長さとタグの両方に適合する候補ノードのビーム
    /// エントリへ正のスコアを追加し、違反ノードの3つ組へ-1を
    /// 追加します。
    ///
    /// # 戻り値
    ///
    /// 適合候補ノード数を境界の総ノード数で割った損失比（0以上1以下）
    fn add_bad_node2(&mut self, node: ConnectionPtr, constraint: usize) -> f32 {
        let Self {
            analyzer,
            example,
            features,
            feature_buf,
            ..
        } = self;
        let nc = &example.nodes()[constraint];
        let lattice = analyzer.lattice();
        let starts = lattice.boundary(nc.boundary as u16).starts();

        let check_tags = |pos: u16| {
            let row = starts.entry_row(pos);
            nc.tags
                .iter()
                .all(|t| row[usize::from(t.field)] == t.value)
        };

        let mut count = 0i32;
        let mut nodes = 0i32;

        // PASS1: count the qualifying candidates
        for i in 0..starts.num_entries() {
            if i32::from(starts.node_info(i).num_codepoints) != nc.length {
                continue;
            }
            if !check_tags(i) {
                continue;
            }
            for entry in starts.beam_row(i) {
                if entry.is_fake() {
                    continue;
                }
                if lattice.connection(entry.conn) == node {
                    continue;
                }
                count += 1;
            }
            nodes += 1;
        }

        if count == 0 {
            // nothing to reward here
            return 0.0;
        }

        let score = 1.0 / count as f32;
        let calc = NgramFeatureCalculator::new(lattice, analyzer.templates());
        trace!(boundary = nc.boundary, "adding tag-constraint features");
        feature_buf.resize(analyzer.templates().len(), 0);

        // PASS2: emit the positive features
        for i in 0..starts.num_entries() {
            if i32::from(starts.node_info(i).num_codepoints) != nc.length {
                continue;
            }
            if !check_tags(i) {
                continue;
            }
            for entry in starts.beam_row(i) {
                if entry.is_fake() {
                    continue;
                }
                let t0 = lattice.connection(entry.conn);
                if t0 == node {
                    continue;
                }
                let t1 = lattice.connection(t0.previous);
                let t2 = lattice.connection(t1.previous);
                calc.calculate_ngram_features(
                    &NgramFeatureRef {
                        t2: t2.node_ptr(),
                        t1: t1.node_ptr(),
                        t0: t0.node_ptr(),
                    },
                    feature_buf,
                );
                for &f in feature_buf.iter() {
                    features.push(ScoredFeature { feature: f, score });
                }
            }
        }

        {
            let t1 = lattice.connection(node.previous);
            let t2 = lattice.connection(t1.previous);
            calc.calculate_ngram_features(
                &NgramFeatureRef {
                    t2: t2.node_ptr(),
                    t1: t1.node_ptr(),
                    t0: node.node_ptr(),
                },
                feature_buf,
            );
            for &f in feature_buf.iter() {
                features.push(ScoredFeature {
                    feature: f,
                    score: -1.0,
                });
            }
        }

        nodes as f32 / f32::from(starts.num_entries())
    }

    /// 最後の内容ノードを正解と突き合わせます
    ///
    /// 正解の切れ目がノード内部に落ちている、またはノード制約に
    /// 反している場合、正解に適合するEOS直前候補へ正、最良パスの
    /// 末尾3つ組へ負の素性を追加します。
    fn handle_eos(&mut self) {
        let Self {
            analyzer,
            example,
            features,
            feature_buf,
            loss,
            ..
        } = self;
        let lattice = analyzer.lattice();
        let eos_boundary = lattice.created_boundary_count() - 1;
        let eos_view = lattice.boundary(eos_boundary);
        let top = eos_view.starts().beam_at(0, 0);
        let top_conn = lattice.connection(top.conn);
        let prev = lattice.connection(top_conn.previous);
        let prev_starts = lattice.boundary(prev.boundary).starts();
        let prev_len = i32::from(prev_starts.node_info(prev.right).num_codepoints);
        let prev_start = i32::from(prev.boundary);
        let prev_end = prev_start + prev_len;

        let mut invalid_node = false;
        for &b in example.boundaries() {
            if prev_start < b && b < prev_end {
                invalid_node = true;
            }
        }
        let prev_fields = prev_starts.entry_row(prev.right);
        for nc in example.nodes() {
            if nc.boundary == prev_start {
                if nc.length != prev_len {
                    invalid_node = true;
                    break;
                }
                for tag in &nc.tags {
                    if prev_fields[usize::from(tag.field)] != tag.value {
                        invalid_node = true;
                        break;
                    }
                }
            }
        }
        if !invalid_node {
            return;
        }

        let mut nodes = 0i32;
        let mut beams = 0i32;
        for prev_ptr in eos_view.ends().node_ptrs() {
            let starts = lattice.boundary(prev_ptr.boundary).starts();
            if example.does_node_match(starts, prev_ptr.boundary, prev_ptr.position) {
                if prev.node_ptr() == *prev_ptr {
                    // the decoded tail already agrees with the gold, stop early
                    return;
                }
                nodes += 1;
                for entry in starts.beam_row(prev_ptr.position) {
                    if entry.is_fake() {
                        break;
                    }
                    beams += 1;
                }
            }
        }
        if nodes == 0 {
            return;
        }

        let score = 1.0 / beams as f32;
        *loss += 1.0 * nodes as f32
            / eos_view.ends().node_ptrs().len() as f32
            / f32::from(lattice.created_boundary_count());

        let calc = NgramFeatureCalculator::new(lattice, analyzer.templates());
        trace!(boundary = eos_boundary, "adding EOS features");
        feature_buf.resize(analyzer.templates().len(), 0);
        let eos_ptr = LatticeNodePtr {
            boundary: eos_boundary,
            position: 0,
        };

        for prev_ptr in eos_view.ends().node_ptrs() {
            let starts = lattice.boundary(prev_ptr.boundary).starts();
            if example.does_node_match(starts, prev_ptr.boundary, prev_ptr.position) {
                for entry in starts.beam_row(prev_ptr.position) {
                    if entry.is_fake() {
                        break;
                    }
                    let prev2 = lattice.connection(lattice.connection(entry.conn).previous);
                    calc.calculate_ngram_features(
                        &NgramFeatureRef {
                            t2: prev2.node_ptr(),
                            t1: prev.node_ptr(),
                            t0: eos_ptr,
                        },
                        feature_buf,
                    );
                    for &f in feature_buf.iter() {
                        features.push(ScoredFeature { feature: f, score });
                    }
                }
            }
        }

        let top1_prev = lattice.connection(top_conn.previous);
        let top1_prev2 = lattice.connection(top1_prev.previous);
        calc.calculate_ngram_features(
            &NgramFeatureRef {
                t2: top1_prev2.node_ptr(),
                t1: top1_prev.node_ptr(),
                t0: top_conn.node_ptr(),
            },
            feature_buf,
        );
        for &f in feature_buf.iter() {
            features.push(ScoredFeature {
                feature: f,
                score: -1.0,
            });
        }
    }

    /// 勾配をマスク・整列し、同一ハッシュを合算します
    ///
    /// マスク後に衝突した素性はスコアの加算で1つに統合されます。
    fn finalize_features(&mut self) {
        for f in self.features.iter_mut() {
            f.feature &= self.mask;
        }
        self.features.sort_by_key(|f| f.feature);
        if self.features.len() <= 1 {
            return;
        }
        let mut prev = 0;
        for cur in 1..self.features.len() {
            let item = self.features[cur];
            if self.features[prev].feature == item.feature {
                self.features[prev].score += item.score;
            } else {
                prev += 1;
                if prev != cur {
                    self.features[prev] = item;
                }
            }
        }
        self.features.truncate(prev + 1);
    }
}
