//! 音声認識テキストと選択肢の照合

use super::types::Choice;

/// 位置ごとの序数語
const POSITION_WORDS: [[&str; 3]; 2] = [["first", "one", "1"], ["second", "two", "2"]];

/// 直後の基数を修飾する序数語（"second one" の "one" は位置指定ではない）
const ORDINAL_WORDS: [&str; 3] = ["first", "second", "third"];

/// キーワードとみなす最小文字数（これより長い単語のみ）
const MIN_KEYWORD_LEN: usize = 3;

/// 記号を除去して小文字化し、単語に分割する
pub fn normalize(text: &str) -> Vec<String> {
    text.chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() {
                c.to_ascii_lowercase()
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// ラベルのキーワード集合
pub fn keywords(label: &str) -> Vec<String> {
    let mut words: Vec<String> = normalize(label)
        .into_iter()
        .filter(|w| w.chars().count() > MIN_KEYWORD_LEN)
        .collect();
    words.dedup();
    words
}

fn is_position_word(tokens: &[String], index: usize, position: usize) -> bool {
    let Some(candidates) = POSITION_WORDS.get(position) else {
        return false;
    };
    let token = tokens[index].as_str();
    if !candidates.contains(&token) {
        return false;
    }
    if ORDINAL_WORDS.contains(&token) {
        return true;
    }
    // 基数語は直前が序数語なら無視する
    index == 0 || !ORDINAL_WORDS.contains(&tokens[index - 1].as_str())
}

/// 認識テキストに最初に合致した選択肢を返す
///
/// 選択肢を順に調べ、キーワードか位置の序数語を含んでいれば合致とする。
pub fn match_choice<'a>(transcript: &str, choices: &'a [Choice]) -> Option<&'a Choice> {
    let tokens = normalize(transcript);
    if tokens.is_empty() {
        return None;
    }

    choices.iter().enumerate().find_map(|(position, choice)| {
        let by_keyword = keywords(&choice.label)
            .iter()
            .any(|k| tokens.iter().any(|t| t == k));
        let by_position = (0..tokens.len()).any(|i| is_position_word(&tokens, i, position));
        (by_keyword || by_position).then_some(choice)
    })
}
