//! 部分アノテーション例の表現と読み込みのモジュール。
//!
//! 部分アノテーション例は、表層文字列と、必須の切れ目（境界）の列、
//! およびノード制約（特定の境界に特定の長さ・タグのノードが存在する
//! ことの要求）で構成されます。
//!
//! ファイル形式は改行区切りのレコードで、空行がレコードの終端です。
//! 各行の形式は以下のいずれかです。
//!
//! - 先頭行の`# コメント` - コメントとして保存
//! - `表層` のみの行 - 自由チャンク。直後に切れ目が要求される
//! - `,表層,フィールド名:値,…` - 制約付きノード。切れ目に加えて
//!   長さとタグの制約が付く
//!
//! 文字位置はバイトではなくコードポイント単位です。位置カウンタは
//! BOS余白の2から始まり、レコード終端で末尾の境界（EOS位置）は
//! 取り除かれます。

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use hashbrown::HashMap;

use crate::analyzer::lattice::StartsView;
use crate::dictionary::Dictionary;
use crate::errors::{Result, TremoloError};
use crate::utils;

/// エントリ行が満たすべきタグ制約
///
/// （フィールド添字, 値ID）の組です。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TagConstraint {
    /// 辞書フィールドの添字
    pub field: u16,
    /// 要求される値ID
    pub value: i32,
}

/// ある境界に対するノード制約
///
/// 「この境界にちょうどこのコードポイント長のノードが存在し、列挙
/// されたすべてのタグフィールドが一致する」ことを要求します。
#[derive(Clone, Debug, PartialEq)]
pub struct NodeConstraint {
    /// ノードの表層形
    pub surface: String,
    /// ノードが始まる境界
    pub boundary: i32,
    /// 要求されるコードポイント長
    pub length: i32,
    /// タグ制約のリスト
    pub tags: Vec<TagConstraint>,
}

/// 部分アノテーション例
///
/// 1回の学習ステップより長生きし、リーダーによって再利用されます。
#[derive(Default, Clone, Debug)]
pub struct PartialExample {
    pub(crate) surface: String,
    pub(crate) boundaries: Vec<i32>,
    pub(crate) nodes: Vec<NodeConstraint>,
    pub(crate) comment: String,
    pub(crate) file: String,
    pub(crate) line: usize,
}

impl PartialExample {
    /// 表層文字列を返します
    #[inline(always)]
    pub fn surface(&self) -> &str {
        &self.surface
    }

    /// 必須の切れ目の列を返します
    ///
    /// 境界は狭義単調増加で、すべて2以上です。
    #[inline(always)]
    pub fn boundaries(&self) -> &[i32] {
        &self.boundaries
    }

    /// ノード制約のスライスを返します
    #[inline(always)]
    pub fn nodes(&self) -> &[NodeConstraint] {
        &self.nodes
    }

    /// コメントを返します
    #[inline(always)]
    pub fn comment(&self) -> &str {
        &self.comment
    }

    /// 読み込み元のファイル名を返します
    #[inline(always)]
    pub fn file(&self) -> &str {
        &self.file
    }

    /// 読み込み元の行番号を返します
    #[inline(always)]
    pub fn line(&self) -> usize {
        self.line
    }

    /// 指定ノードがこの例の正解に適合するかどうかを判定します
    ///
    /// ノードの開始境界が正解の切れ目に一致する（または先頭チャンクの
    /// 開始位置2である）こと、および登録されたノード制約（あれば長さと
    /// タグ、なければ次の切れ目までの長さ上限）を満たすことを確認します。
    pub fn does_node_match(&self, starts: StartsView, boundary: u16, position: u16) -> bool {
        let b = i32::from(boundary);
        let idx = self.boundaries.partition_point(|&x| x < b);
        if idx == self.boundaries.len() {
            return false;
        }
        if self.boundaries[idx] != b && b != 2 {
            return false;
        }

        let len = i32::from(starts.node_info(position).num_codepoints);
        let Some(nc) = self.nodes.iter().find(|n| n.boundary == b) else {
            let next = idx + 1;
            if next < self.boundaries.len() {
                // a node longer than the next cut is bad
                return len <= self.boundaries[next] - b;
            }
            return true;
        };

        if len != nc.length {
            return false;
        }
        let row = starts.entry_row(position);
        nc.tags
            .iter()
            .all(|t| row[usize::from(t.field)] == t.value)
    }

    /// この例をレコード形式で書き出します
    ///
    /// タグの値IDは辞書の対応表で文字列へ戻されます。
    ///
    /// # エラー
    ///
    /// 値IDが辞書に存在しない（未知文字列ハッシュだった）場合、
    /// [`TremoloError`]が返されます。
    pub fn write<W>(&self, dict: &Dictionary, wtr: W) -> Result<()>
    where
        W: Write,
    {
        let mut wtr = wtr;
        if !self.comment.is_empty() {
            writeln!(&mut wtr, "# {}", self.comment)?;
        }
        let chars: Vec<char> = self.surface.chars().collect();
        let total_end = 2 + chars.len() as i32;
        let mut start = 2i32;
        for &end in self.boundaries.iter().chain(std::iter::once(&total_end)) {
            let chunk: String = chars[(start - 2) as usize..(end - 2) as usize]
                .iter()
                .collect();
            let nc = self
                .nodes
                .iter()
                .find(|n| n.boundary == start && n.length == end - start);
            match nc {
                Some(nc) => {
                    write!(&mut wtr, ",{chunk}")?;
                    for tag in &nc.tags {
                        let field = &dict.fields()[usize::from(tag.field)];
                        let value = field.value_str(tag.value).ok_or_else(|| {
                            TremoloError::invalid_state(
                                "cannot write the example",
                                format!("the value id {} has no string form", tag.value),
                            )
                        })?;
                        write!(&mut wtr, ",{}:{}", field.name(), value)?;
                    }
                    writeln!(&mut wtr)?;
                }
                None => {
                    writeln!(&mut wtr, "{chunk}")?;
                }
            }
            start = end;
        }
        writeln!(&mut wtr)?;
        Ok(())
    }
}

/// 部分アノテーション例のリーダー
///
/// タブ区切りまたはカンマ区切りのレコード列を消費します。
/// エスケープ規則はCSVレクサーに委譲されます。フィールド名は辞書
/// スペックに対して解決され、値は各フィールドの対応表で、対応が
/// なければ決定的な未知文字列ハッシュでIDに解決されます。
pub struct PartialExampleReader {
    dict: Arc<Dictionary>,
    field_index: HashMap<String, u16>,
    filename: String,
    lines: Vec<String>,
    cursor: usize,
    delimiter: u8,
}

impl PartialExampleReader {
    /// 新しいリーダーを作成します
    ///
    /// # 引数
    ///
    /// * `dict` - フィールド名と値を解決する辞書
    pub fn new(dict: Arc<Dictionary>) -> Self {
        let field_index = dict
            .fields()
            .iter()
            .map(|f| (f.name().to_string(), f.index() as u16))
            .collect();
        Self {
            dict,
            field_index,
            filename: String::new(),
            lines: vec![],
            cursor: 0,
            delimiter: b',',
        }
    }

    /// フィールドの区切り文字を変更します
    ///
    /// デフォルトはカンマです。
    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// メモリ上のデータを読み込み対象に設定します
    pub fn set_data(&mut self, data: &str) {
        self.filename = "<memory>".to_string();
        self.lines = data.lines().map(str::to_string).collect();
        self.cursor = 0;
    }

    /// ファイルを読み込み対象に設定します
    ///
    /// # エラー
    ///
    /// ファイルが読めない場合、I/Oエラーが返されます。
    pub fn open_file<P>(&mut self, path: P) -> Result<()>
    where
        P: AsRef<Path>,
    {
        let contents = std::fs::read_to_string(path.as_ref())?;
        self.set_data(&contents);
        self.filename = path.as_ref().display().to_string();
        Ok(())
    }

    /// 次の例を読み込みます
    ///
    /// # 戻り値
    ///
    /// 読み込めた場合は`Some(例)`、入力の終端に達した場合は`None`
    ///
    /// # エラー
    ///
    /// 行の形式が不正な場合、`ファイル名:行番号`を含む
    /// [`TremoloError`]が返されます。
    pub fn read_example(&mut self) -> Result<Option<PartialExample>> {
        let mut result = PartialExample {
            file: self.filename.clone(),
            ..Default::default()
        };
        let mut first_line = true;
        let mut boundary = 2i32;
        let mut any_content = false;

        while self.cursor < self.lines.len() {
            let line_number = self.cursor + 1;
            let line = &self.lines[self.cursor];
            self.cursor += 1;
            let fields = utils::parse_delimited_row(line, self.delimiter);

            if first_line {
                result.line = line_number;
                first_line = false;
                if fields.len() == 1 {
                    let fld = &fields[0];
                    if fld.len() > 2 && fld.starts_with("# ") {
                        result.comment = fld[2..].to_string();
                        continue;
                    }
                }
            }

            if fields.len() == 1 {
                let data = &fields[0];
                if data.is_empty() {
                    // a blank line terminates the record; EOS is not a cut
                    result.boundaries.pop();
                    return Ok(Some(result));
                }
                any_content = true;
                result.surface.push_str(data);
                boundary += data.chars().count() as i32;
                result.boundaries.push(boundary);
                continue;
            }

            if !fields[0].is_empty() {
                return Err(TremoloError::invalid_format(
                    "partial example",
                    format!(
                        "in file: {}:{} the first field was not empty, but [{}]",
                        self.filename, line_number, fields[0]
                    ),
                ));
            }

            any_content = true;
            let surface = &fields[1];
            let length = surface.chars().count() as i32;
            let mut nc = NodeConstraint {
                surface: surface.clone(),
                boundary,
                length,
                tags: vec![],
            };
            boundary += length;
            result.surface.push_str(surface);
            result.boundaries.push(boundary);

            for fld in &fields[2..] {
                let Some(colon) = fld.find(':') else {
                    return Err(TremoloError::invalid_format(
                        "partial example",
                        format!(
                            "in file: {}:{} an entry [{}] did not contain a field name \
                             (<name>:<value>)",
                            self.filename, line_number, fld
                        ),
                    ));
                };
                let (name, value) = (&fld[..colon], &fld[colon + 1..]);
                let Some(&field_idx) = self.field_index.get(name) else {
                    return Err(TremoloError::invalid_format(
                        "partial example",
                        format!(
                            "in file: {}:{} the field name of an entry [{}] was not present \
                             in the dictionary spec",
                            self.filename, line_number, fld
                        ),
                    ));
                };
                let id = self.dict.fields()[usize::from(field_idx)].value_id_or_hash(value);
                nc.tags.push(TagConstraint {
                    field: field_idx,
                    value: id,
                });
            }

            result.nodes.push(nc);
        }

        if !any_content && result.comment.is_empty() {
            return Ok(None);
        }
        result.boundaries.pop();
        Ok(Some(result))
    }

    /// 入力終端まで例を読み込みます
    ///
    /// 表層が空のレコード（連続する空行の産物）は読み飛ばされます。
    pub fn read_all(&mut self) -> Result<Vec<PartialExample>> {
        let mut examples = vec![];
        while let Some(example) = self.read_example()? {
            if !example.surface.is_empty() {
                examples.push(example);
            }
        }
        Ok(examples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_dict() -> Arc<Dictionary> {
        let data = "もも,N,0\nも,PRT,1\n";
        Arc::new(Dictionary::from_reader(data.as_bytes(), &["surface", "pos", "subpos"]).unwrap())
    }

    #[test]
    fn test_read_free_chunks() {
        let mut reader = PartialExampleReader::new(toy_dict());
        reader.set_data("もも\nも\nもも\n\n");
        let example = reader.read_example().unwrap().unwrap();
        assert_eq!(example.surface(), "ももももも");
        assert_eq!(example.boundaries(), &[4, 5]);
        assert!(example.nodes().is_empty());
        assert!(reader.read_example().unwrap().is_none());
    }

    #[test]
    fn test_read_constrained_nodes() {
        let mut reader = PartialExampleReader::new(toy_dict());
        reader.set_data(",もも,pos:N,subpos:0\n,も,pos:PRT,subpos:1\n,もも,pos:N,subpos:0\n\n");
        let example = reader.read_example().unwrap().unwrap();
        assert_eq!(example.surface(), "ももももも");
        assert_eq!(example.boundaries(), &[4, 5]);
        assert_eq!(example.nodes().len(), 3);
        let first = &example.nodes()[0];
        assert_eq!(first.boundary, 2);
        assert_eq!(first.length, 2);
        assert_eq!(
            first.tags,
            vec![
                TagConstraint { field: 1, value: 0 },
                TagConstraint { field: 2, value: 0 },
            ]
        );
        let second = &example.nodes()[1];
        assert_eq!(second.boundary, 4);
        assert_eq!(second.length, 1);
    }

    #[test]
    fn test_read_comment() {
        let mut reader = PartialExampleReader::new(toy_dict());
        reader.set_data("# 部分アノテーション\nもも\nもも\n\n");
        let example = reader.read_example().unwrap().unwrap();
        assert_eq!(example.comment(), "部分アノテーション");
        assert_eq!(example.surface(), "もももも");
        assert_eq!(example.boundaries(), &[4]);
    }

    #[test]
    fn test_unknown_value_hashes() {
        let mut reader = PartialExampleReader::new(toy_dict());
        reader.set_data(",もも,pos:N,subpos:10\n\n");
        let example = reader.read_example().unwrap().unwrap();
        let tag = example.nodes()[0].tags[1];
        assert!(tag.value < 0);
    }

    #[test]
    fn test_error_on_nonempty_first_field() {
        let mut reader = PartialExampleReader::new(toy_dict());
        reader.set_data("もも,pos:N\n\n");
        let err = reader.read_example().unwrap_err();
        let msg = format!("{err}");
        assert!(msg.contains("<memory>:1"));
    }

    #[test]
    fn test_error_on_missing_colon() {
        let mut reader = PartialExampleReader::new(toy_dict());
        reader.set_data("もも\n,もも,posN\n\n");
        let err = reader.read_example().unwrap_err();
        let msg = format!("{err}");
        assert!(msg.contains("<memory>:2"));
        assert!(msg.contains("field name"));
    }

    #[test]
    fn test_error_on_unknown_field_name() {
        let mut reader = PartialExampleReader::new(toy_dict());
        reader.set_data(",もも,unknown:N\n\n");
        let err = reader.read_example().unwrap_err();
        let msg = format!("{err}");
        assert!(msg.contains("dictionary spec"));
    }

    #[test]
    fn test_multiple_records() {
        let mut reader = PartialExampleReader::new(toy_dict());
        reader.set_data("もも\nも\n\nも\nもも\n\n");
        let examples = reader.read_all().unwrap();
        assert_eq!(examples.len(), 2);
        assert_eq!(examples[0].surface(), "ももも");
        assert_eq!(examples[0].boundaries(), &[4]);
        assert_eq!(examples[1].surface(), "ももも");
        assert_eq!(examples[1].boundaries(), &[3]);
        assert_eq!(examples[1].line(), 4);
    }

    #[test]
    fn test_missing_trailing_blank_line() {
        let mut reader = PartialExampleReader::new(toy_dict());
        reader.set_data("もも\nも");
        let example = reader.read_example().unwrap().unwrap();
        assert_eq!(example.surface(), "ももも");
        assert_eq!(example.boundaries(), &[4]);
        assert!(reader.read_example().unwrap().is_none());
    }

    #[test]
    fn test_tab_separated() {
        let mut reader = PartialExampleReader::new(toy_dict()).with_delimiter(b'\t');
        reader.set_data("\tもも\tpos:N\nも\n\n");
        let example = reader.read_example().unwrap().unwrap();
        assert_eq!(example.surface(), "ももも");
        assert_eq!(example.nodes().len(), 1);
        assert_eq!(example.nodes()[0].tags, vec![TagConstraint { field: 1, value: 0 }]);
    }

    #[test]
    fn test_write_round_trip() {
        let dict = toy_dict();
        let mut reader = PartialExampleReader::new(Arc::clone(&dict));
        let text = "# コメント付き\n,もも,pos:N,subpos:0\nも\n,もも,pos:N,subpos:0\n\n";
        reader.set_data(text);
        let example = reader.read_example().unwrap().unwrap();

        let mut written = vec![];
        example.write(&dict, &mut written).unwrap();
        let mut reader2 = PartialExampleReader::new(Arc::clone(&dict));
        reader2.set_data(std::str::from_utf8(&written).unwrap());
        let round_tripped = reader2.read_example().unwrap().unwrap();

        assert_eq!(example.surface(), round_tripped.surface());
        assert_eq!(example.boundaries(), round_tripped.boundaries());
        assert_eq!(example.nodes(), round_tripped.nodes());
        assert_eq!(example.comment(), round_tripped.comment());
    }
}
