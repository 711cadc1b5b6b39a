//! Tremoloのテストモジュール群
//!
//! 各コンポーネント(analyzer、trainer等)の動作を検証するテストを
//! 含みます。

mod analyzer;
