//! 学習用のインメモリ辞書を管理するモジュール
//!
//! このモジュールは、学習コアが参照する小規模な語彙情報を提供します。
//! 辞書はCSVリーダーから構築され、各行が1単語に対応します。先頭フィールドは
//! 表層形、以降のフィールドは品詞などの属性値です。フィールド名は構築時に
//! 与えられる辞書スペックで決まり、各フィールドは文字列から整数IDへの
//! 対応表を保持します。
//!
//! 表層形が`UNK`の行は未知語テンプレートとして扱われ、通常の前方一致検索の
//! 対象から外れます。未知語ノードの表層IDは生成時に表層文字列のハッシュで
//! 置き換えられます。

use std::io::{BufRead, BufReader, Read};

use hashbrown::HashMap;

use crate::analyzer::features::hash_unk_string;
use crate::errors::{Result, TremoloError};
use crate::utils::{self, FromU32};

/// 未知語テンプレートを表す表層形
const UNK_SURFACE: &str = "UNK";

/// 辞書フィールドの定義
///
/// フィールド名と、そのフィールドが取りうる値の文字列からIDへの対応表を
/// 保持します。IDは登場順に割り当てられます。
pub struct FieldDef {
    name: String,
    index: usize,
    str2id: HashMap<String, i32>,
    id2str: Vec<String>,
}

impl FieldDef {
    fn new(name: &str, index: usize) -> Self {
        Self {
            name: name.to_string(),
            index,
            str2id: HashMap::new(),
            id2str: vec![],
        }
    }

    /// フィールド名を返します
    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 辞書スペック内でのフィールド位置を返します
    #[inline(always)]
    pub fn index(&self) -> usize {
        self.index
    }

    /// 値文字列に対応するIDを返します
    ///
    /// # 戻り値
    ///
    /// 登録済みであれば`Some(ID)`、未登録であれば`None`
    pub fn value_id(&self, value: &str) -> Option<i32> {
        self.str2id.get(value).copied()
    }

    /// 値文字列をIDに解決します
    ///
    /// 対応表に存在しない値は決定的な未知文字列ハッシュにフォールバックします。
    pub fn value_id_or_hash(&self, value: &str) -> i32 {
        self.value_id(value)
            .unwrap_or_else(|| hash_unk_string(value))
    }

    /// IDに対応する値文字列を返します
    pub fn value_str(&self, id: i32) -> Option<&str> {
        usize::try_from(id)
            .ok()
            .and_then(|i| self.id2str.get(i))
            .map(String::as_str)
    }

    fn intern(&mut self, value: &str) -> i32 {
        if let Some(&id) = self.str2id.get(value) {
            return id;
        }
        let id = i32::try_from(self.id2str.len()).unwrap();
        self.str2id.insert(value.to_string(), id);
        self.id2str.push(value.to_string());
        id
    }
}

/// 辞書の1エントリ
///
/// 表層形の文字配列と、各フィールドの値IDの行を保持します。
pub struct DictEntry {
    surface: String,
    chars: Vec<char>,
    row: Vec<i32>,
    unk: bool,
}

impl DictEntry {
    /// 表層形を返します
    #[inline(always)]
    pub fn surface(&self) -> &str {
        &self.surface
    }

    /// 表層形の文字配列を返します
    #[inline(always)]
    pub fn chars(&self) -> &[char] {
        &self.chars
    }

    /// フィールド値IDの行を返します
    ///
    /// 行の先頭は表層形フィールドのIDです。
    #[inline(always)]
    pub fn row(&self) -> &[i32] {
        &self.row
    }

    /// このエントリが未知語テンプレートかどうかを返します
    #[inline(always)]
    pub fn is_unk(&self) -> bool {
        self.unk
    }
}

/// 学習用のインメモリ辞書
///
/// フィールド定義、エントリ、先頭文字から候補エントリへの索引を保持します。
pub struct Dictionary {
    fields: Vec<FieldDef>,
    entries: Vec<DictEntry>,
    index: HashMap<char, Vec<u32>>,
    unk_entries: Vec<u32>,
}

impl Dictionary {
    /// 指定されたリーダーから辞書を読み込みます
    ///
    /// 各行はCSV形式で、フィールド数は`field_names`の長さと一致する
    /// 必要があります。空行は無視されます。
    ///
    /// # 引数
    ///
    /// * `rdr` - 辞書のリーダー
    /// * `field_names` - フィールド名のリスト（先頭は表層形フィールド）
    ///
    /// # 戻り値
    ///
    /// 構築された辞書
    ///
    /// # エラー
    ///
    /// 行のフィールド数が辞書スペックと一致しない場合、
    /// [`TremoloError`]が返されます。
    pub fn from_reader<R>(rdr: R, field_names: &[&str]) -> Result<Self>
    where
        R: Read,
    {
        if field_names.is_empty() {
            return Err(TremoloError::invalid_argument(
                "field_names",
                "the dictionary spec must declare at least one field",
            ));
        }

        let mut fields: Vec<FieldDef> = field_names
            .iter()
            .enumerate()
            .map(|(i, name)| FieldDef::new(name, i))
            .collect();
        let mut entries = vec![];
        let mut index: HashMap<char, Vec<u32>> = HashMap::new();
        let mut unk_entries = vec![];

        let buf = BufReader::new(rdr);
        for line in buf.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let row_strs = utils::parse_csv_row(&line);
            if row_strs.len() != fields.len() {
                return Err(TremoloError::invalid_format(
                    "rdr",
                    format!(
                        "expected {} fields but got {} in [{}]",
                        fields.len(),
                        row_strs.len(),
                        line
                    ),
                ));
            }
            let row: Vec<i32> = row_strs
                .iter()
                .zip(fields.iter_mut())
                .map(|(value, field)| field.intern(value))
                .collect();
            let surface = &row_strs[0];
            let unk = surface == UNK_SURFACE;
            let entry_id = u32::try_from(entries.len())?;
            if unk {
                unk_entries.push(entry_id);
            } else if let Some(first) = surface.chars().next() {
                index.entry(first).or_default().push(entry_id);
            }
            entries.push(DictEntry {
                surface: surface.clone(),
                chars: surface.chars().collect(),
                row,
                unk,
            });
        }

        Ok(Self {
            fields,
            entries,
            index,
            unk_entries,
        })
    }

    /// フィールド数を返します
    #[inline(always)]
    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }

    /// フィールド定義のスライスを返します
    #[inline(always)]
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    /// 名前からフィールド定義を検索します
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// エントリ数を返します
    #[inline(always)]
    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    /// 指定IDのエントリを返します
    #[inline(always)]
    pub fn entry(&self, id: u32) -> &DictEntry {
        &self.entries[usize::from_u32(id)]
    }

    /// 指定文字で始まるエントリIDのスライスを返します
    ///
    /// 未知語テンプレートは含まれません。
    pub fn entries_from_char(&self, c: char) -> &[u32] {
        self.index.get(&c).map(Vec::as_slice).unwrap_or(&[])
    }

    /// 未知語テンプレートのエントリIDのスライスを返します
    #[inline(always)]
    pub fn unk_entries(&self) -> &[u32] {
        &self.unk_entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_dict() -> Dictionary {
        let data = "もも,N,0\nも,PRT,1\nUNK,N,10\n";
        Dictionary::from_reader(data.as_bytes(), &["surface", "pos", "subpos"]).unwrap()
    }

    #[test]
    fn test_load_dictionary() {
        let dict = toy_dict();
        assert_eq!(dict.num_fields(), 3);
        assert_eq!(dict.num_entries(), 3);
        assert_eq!(dict.entry(0).surface(), "もも");
        assert_eq!(dict.entry(0).chars(), &['も', 'も']);
        assert!(!dict.entry(0).is_unk());
        assert!(dict.entry(2).is_unk());
        assert_eq!(dict.unk_entries(), &[2]);
    }

    #[test]
    fn test_value_ids_in_insertion_order() {
        let dict = toy_dict();
        let pos = dict.field("pos").unwrap();
        assert_eq!(pos.value_id("N"), Some(0));
        assert_eq!(pos.value_id("PRT"), Some(1));
        assert_eq!(pos.value_str(1), Some("PRT"));
        assert_eq!(pos.value_id("V"), None);
    }

    #[test]
    fn test_unknown_value_falls_back_to_hash() {
        let dict = toy_dict();
        let subpos = dict.field("subpos").unwrap();
        let id = subpos.value_id_or_hash("99");
        assert!(id < 0);
        assert_eq!(id, subpos.value_id_or_hash("99"));
    }

    #[test]
    fn test_prefix_index() {
        let dict = toy_dict();
        let ids = dict.entries_from_char('も');
        assert_eq!(ids, &[0, 1]);
        assert!(dict.entries_from_char('x').is_empty());
    }

    #[test]
    fn test_field_count_mismatch() {
        let data = "もも,N\n";
        let result = Dictionary::from_reader(data.as_bytes(), &["surface", "pos", "subpos"]);
        assert!(result.is_err());
    }
}
