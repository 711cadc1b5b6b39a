//! N-gram素性の計算モジュール。
//!
//! このモジュールは、ラティスノードの3つ組（t-2, t-1, t-0）から
//! 素性ハッシュの列を計算する機能を提供します。素性は宣言された
//! テンプレートの合成で定義され、各テンプレートはスロット
//! （3つ組内の位置）と属性アクセサの組み合わせです。
//!
//! 出力は決定的です。同じ入力からは常に同じハッシュ列が得られます。
//! ハッシュは事前にミックスされたu32で、重み表サイズによるマスクは
//! スコアラー側で行われます。

use crate::analyzer::lattice::{Lattice, LatticeNodePtr};

/// 素性ハッシュの初期シード
const FEATURE_SEED: u64 = 0xa076_1d64_78bd_642f;

/// ミックス用の乗数
const MIX_MULT: u64 = 0x9e37_79b9_7f4a_7c15;

/// 3つ組内のスロット
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NgramSlot {
    /// 2つ前のノード（t-2）
    TwoBack,
    /// 1つ前のノード（t-1）
    OneBack,
    /// 現在のノード（t-0）
    Current,
}

/// ノードの属性アクセサ
///
/// テンプレートの1項目はスロットと属性の組です。辞書フィールドは
/// 添字で参照され、それ以外は表層由来の属性です。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeAttr {
    /// フィールド行の値（表層ID、品詞IDなど）
    Field(u16),
    /// コードポイント長
    Length,
    /// 先頭コードポイント
    FirstChar,
    /// 先頭コードポイントの文字種
    FirstCharClass,
    /// 末尾コードポイント
    LastChar,
    /// 末尾コードポイントの文字種
    LastCharClass,
    /// 表層の接頭辞の署名（先頭コードポイントと長さの合成）
    Prefix,
    /// 表層の接尾辞の署名（末尾コードポイントと長さの合成）
    Suffix,
    /// 未知語グルーピングで長く取られたかどうか
    Longer,
    /// 数字列かどうか
    NumStr,
}

/// 1つのN-gram素性テンプレート
///
/// テンプレートは（スロット, 属性）項目の列で、計算時に各項目の値が
/// 順にハッシュへミックスされます。
#[derive(Clone, Debug)]
pub struct NgramTemplate {
    items: Vec<(NgramSlot, NodeAttr)>,
}

impl NgramTemplate {
    /// 新しいテンプレートを作成します
    ///
    /// # パニック
    ///
    /// 項目が空の場合、パニックします。
    pub fn new(items: Vec<(NgramSlot, NodeAttr)>) -> Self {
        assert!(!items.is_empty());
        Self { items }
    }

    /// このテンプレートがt-0スロットのみを参照するかどうかを返します
    pub fn is_unigram(&self) -> bool {
        self.items.iter().all(|(s, _)| *s == NgramSlot::Current)
    }
}

/// 宣言されたテンプレートの集合
///
/// 素性バッファの長さはこの集合の要素数と常に一致します。
pub struct FeatureTemplateSet {
    templates: Vec<NgramTemplate>,
}

impl FeatureTemplateSet {
    /// テンプレート列から集合を作成します
    pub fn new(templates: Vec<NgramTemplate>) -> Self {
        Self { templates }
    }

    /// 標準のテンプレート集合を作成します
    ///
    /// 辞書のフィールド数に応じて、利用可能なフィールドを参照する
    /// unigram・bigram・trigramテンプレートを構成します。フィールドは
    /// 先頭から順に表層・品詞・品詞細分類とみなされます。
    ///
    /// # 引数
    ///
    /// * `num_fields` - 辞書のフィールド数
    pub fn standard(num_fields: usize) -> Self {
        use NgramSlot::*;
        use NodeAttr::*;

        let w = Field(0);
        let mut templates = vec![
            NgramTemplate::new(vec![(Current, w)]),
            NgramTemplate::new(vec![(Current, Length)]),
            NgramTemplate::new(vec![(Current, FirstCharClass)]),
            NgramTemplate::new(vec![(Current, LastCharClass)]),
            NgramTemplate::new(vec![(Current, Prefix)]),
            NgramTemplate::new(vec![(Current, Suffix)]),
            NgramTemplate::new(vec![(Current, NumStr), (Current, Longer)]),
            NgramTemplate::new(vec![(OneBack, w), (Current, w)]),
            NgramTemplate::new(vec![(OneBack, LastChar), (Current, FirstChar)]),
        ];
        if num_fields >= 2 {
            let pos = Field(1);
            templates.extend([
                NgramTemplate::new(vec![(Current, pos)]),
                NgramTemplate::new(vec![(Current, w), (Current, pos)]),
                NgramTemplate::new(vec![(Current, Length), (Current, pos)]),
                NgramTemplate::new(vec![(OneBack, pos), (Current, pos)]),
                NgramTemplate::new(vec![(OneBack, w), (Current, pos)]),
                NgramTemplate::new(vec![(OneBack, pos), (Current, w)]),
                NgramTemplate::new(vec![(TwoBack, pos), (OneBack, pos), (Current, pos)]),
            ]);
        }
        if num_fields >= 3 {
            let subpos = Field(2);
            templates.extend([
                NgramTemplate::new(vec![(Current, subpos)]),
                NgramTemplate::new(vec![(Current, Field(1)), (Current, subpos)]),
                NgramTemplate::new(vec![(OneBack, subpos), (Current, subpos)]),
            ]);
        }
        Self::new(templates)
    }

    /// テンプレート数を返します
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    /// テンプレートが空かどうかを返します
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// テンプレートのスライスを返します
    #[inline(always)]
    pub fn templates(&self) -> &[NgramTemplate] {
        &self.templates
    }
}

/// 素性計算対象の3つ組
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NgramFeatureRef {
    /// 2つ前のノード
    pub t2: LatticeNodePtr,
    /// 1つ前のノード
    pub t1: LatticeNodePtr,
    /// 現在のノード
    pub t0: LatticeNodePtr,
}

/// 3つ組からN-gram素性ハッシュを計算する計算器
///
/// ラティスとテンプレート集合への参照を保持する軽量なビューです。
pub struct NgramFeatureCalculator<'a> {
    lattice: &'a Lattice,
    templates: &'a FeatureTemplateSet,
}

impl<'a> NgramFeatureCalculator<'a> {
    /// 新しい計算器を作成します
    pub fn new(lattice: &'a Lattice, templates: &'a FeatureTemplateSet) -> Self {
        Self { lattice, templates }
    }

    /// 3つ組の素性ハッシュを計算し、バッファへ書き込みます
    ///
    /// バッファ長はテンプレート数と一致しなければなりません。
    ///
    /// # 引数
    ///
    /// * `ngram` - 計算対象の3つ組
    /// * `out` - 出力バッファ（テンプレートごとに1要素）
    pub fn calculate_ngram_features(&self, ngram: &NgramFeatureRef, out: &mut [u32]) {
        debug_assert_eq!(out.len(), self.templates.len());
        for (i, (template, slot)) in self
            .templates
            .templates()
            .iter()
            .zip(out.iter_mut())
            .enumerate()
        {
            let mut state = mix(FEATURE_SEED, i as u64);
            for &(ngram_slot, attr) in &template.items {
                let node = match ngram_slot {
                    NgramSlot::TwoBack => ngram.t2,
                    NgramSlot::OneBack => ngram.t1,
                    NgramSlot::Current => ngram.t0,
                };
                state = mix(state, self.attr_value(node, attr));
            }
            *slot = fold(state);
        }
    }

    /// ノード単体のunigram素性ハッシュを計算します
    ///
    /// t-0スロットのみを参照するテンプレートについて、
    /// [`calculate_ngram_features`](Self::calculate_ngram_features)と
    /// 同一のハッシュを出力へ追記します。
    pub fn unigram_features(&self, node: LatticeNodePtr, out: &mut Vec<u32>) {
        for (i, template) in self.templates.templates().iter().enumerate() {
            if !template.is_unigram() {
                continue;
            }
            let mut state = mix(FEATURE_SEED, i as u64);
            for &(_, attr) in &template.items {
                state = mix(state, self.attr_value(node, attr));
            }
            out.push(fold(state));
        }
    }

    fn attr_value(&self, ptr: LatticeNodePtr, attr: NodeAttr) -> u64 {
        let starts = self.lattice.boundary(ptr.boundary).starts();
        match attr {
            NodeAttr::Field(i) => starts.entry_row(ptr.position)[usize::from(i)] as u64,
            NodeAttr::Length => u64::from(starts.node_info(ptr.position).num_codepoints),
            NodeAttr::FirstChar => u64::from(starts.node_info(ptr.position).first_char as u32),
            NodeAttr::FirstCharClass => starts.node_info(ptr.position).first_class as u64,
            NodeAttr::LastChar => u64::from(starts.node_info(ptr.position).last_char as u32),
            NodeAttr::LastCharClass => starts.node_info(ptr.position).last_class as u64,
            NodeAttr::Prefix => {
                let info = starts.node_info(ptr.position);
                mix(u64::from(info.first_char as u32), u64::from(info.num_codepoints.min(2)))
            }
            NodeAttr::Suffix => {
                let info = starts.node_info(ptr.position);
                mix(u64::from(info.last_char as u32), u64::from(info.num_codepoints.min(2)))
            }
            NodeAttr::Longer => u64::from(starts.node_info(ptr.position).longer),
            NodeAttr::NumStr => u64::from(starts.node_info(ptr.position).numeric),
        }
    }
}

#[inline(always)]
fn mix(state: u64, value: u64) -> u64 {
    let x = (state ^ value).wrapping_mul(MIX_MULT);
    x ^ (x >> 29)
}

#[inline(always)]
fn fold(state: u64) -> u32 {
    (state ^ (state >> 32)) as u32
}

/// コードポイント列の決定的な未知語IDを計算します
///
/// 辞書の値IDは非負なので、最上位ビットを立てた負の値を返すことで
/// 既存のIDと衝突しないことを保証します。
pub fn hash_unk_chars<I>(chars: I) -> i32
where
    I: IntoIterator<Item = char>,
{
    let mut state = FEATURE_SEED;
    for c in chars {
        state = mix(state, u64::from(c as u32));
    }
    (fold(state) as i32 & 0x3fff_ffff) | i32::MIN
}

/// 辞書に存在しない文字列の決定的なIDを計算します
pub fn hash_unk_string(value: &str) -> i32 {
    hash_unk_chars(value.chars())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::lattice::NodeInfo;
    use crate::sentence::CharClass;

    fn toy_lattice() -> Lattice {
        let mut lattice = Lattice::default();
        lattice.reset(6, 2, 2);
        // BOS at boundaries 0 and 1.
        lattice.push_node(0, NodeInfo { num_codepoints: 1, ..Default::default() }, &[-2, -2]);
        lattice.push_node(1, NodeInfo { num_codepoints: 1, ..Default::default() }, &[-2, -2]);
        let info = NodeInfo {
            num_codepoints: 2,
            first_char: 'も',
            last_char: 'も',
            first_class: CharClass::Hiragana,
            last_class: CharClass::Hiragana,
            ..Default::default()
        };
        lattice.push_node(2, info, &[0, 0]);
        lattice.push_node(2, info, &[1, 1]);
        lattice
    }

    fn tri() -> NgramFeatureRef {
        NgramFeatureRef {
            t2: LatticeNodePtr { boundary: 0, position: 0 },
            t1: LatticeNodePtr { boundary: 1, position: 0 },
            t0: LatticeNodePtr { boundary: 2, position: 0 },
        }
    }

    #[test]
    fn test_deterministic() {
        let lattice = toy_lattice();
        let templates = FeatureTemplateSet::standard(2);
        let calc = NgramFeatureCalculator::new(&lattice, &templates);
        let mut buf1 = vec![0u32; templates.len()];
        let mut buf2 = vec![0u32; templates.len()];
        calc.calculate_ngram_features(&tri(), &mut buf1);
        calc.calculate_ngram_features(&tri(), &mut buf2);
        assert_eq!(buf1, buf2);
    }

    #[test]
    fn test_distinct_nodes_differ() {
        let lattice = toy_lattice();
        let templates = FeatureTemplateSet::standard(2);
        let calc = NgramFeatureCalculator::new(&lattice, &templates);
        let mut buf1 = vec![0u32; templates.len()];
        let mut buf2 = vec![0u32; templates.len()];
        let mut other = tri();
        other.t0.position = 1;
        calc.calculate_ngram_features(&tri(), &mut buf1);
        calc.calculate_ngram_features(&other, &mut buf2);
        // The surface-id template must see the difference.
        assert_ne!(buf1[0], buf2[0]);
    }

    #[test]
    fn test_unigram_features_match_trigram_hashes() {
        let lattice = toy_lattice();
        let templates = FeatureTemplateSet::standard(2);
        let calc = NgramFeatureCalculator::new(&lattice, &templates);
        let mut full = vec![0u32; templates.len()];
        calc.calculate_ngram_features(&tri(), &mut full);
        let mut unigrams = vec![];
        calc.unigram_features(LatticeNodePtr { boundary: 2, position: 0 }, &mut unigrams);
        assert!(!unigrams.is_empty());
        for h in unigrams {
            assert!(full.contains(&h));
        }
    }

    #[test]
    fn test_hash_unk_string() {
        let a = hash_unk_string("モモ");
        let b = hash_unk_string("モモ");
        let c = hash_unk_string("モモも");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a < 0);
        assert!(c < 0);
    }
}
