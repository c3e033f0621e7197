use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// 感情ラベル
///
/// 並び順はモデル出力ベクトルのインデックスと一致する。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Emotion {
    Angry,
    Disgust,
    Fear,
    Happy,
    Sad,
    Surprise,
    Neutral,
}

/// クラス数
pub const NUM_CLASSES: usize = 7;

impl Emotion {
    /// 正規の順序で並べた全ラベル
    pub const ALL: [Emotion; NUM_CLASSES] = [
        Emotion::Angry,
        Emotion::Disgust,
        Emotion::Fear,
        Emotion::Happy,
        Emotion::Sad,
        Emotion::Surprise,
        Emotion::Neutral,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn label(self) -> &'static str {
        match self {
            Emotion::Angry => "Angry",
            Emotion::Disgust => "Disgust",
            Emotion::Fear => "Fear",
            Emotion::Happy => "Happy",
            Emotion::Sad => "Sad",
            Emotion::Surprise => "Surprise",
            Emotion::Neutral => "Neutral",
        }
    }

    /// 正規順のラベル文字列一覧（メタデータ保存用）
    pub fn labels() -> Vec<String> {
        Self::ALL.iter().map(|e| e.label().to_string()).collect()
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// 未知のラベル
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown emotion label: {0}")]
pub struct UnknownEmotion(pub String);

impl FromStr for Emotion {
    type Err = UnknownEmotion;

    /// 大文字小文字を区別しない（データセットのディレクトリ名は小文字）
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|e| e.label().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| UnknownEmotion(s.to_string()))
    }
}

/// 保存されたラベル列を検証し、出力インデックス -> ラベルの対応表を作る
///
/// 7個ちょうど・既知のラベルのみ・重複なし、を満たさなければエラー。
pub fn validate_label_order(labels: &[String]) -> anyhow::Result<Vec<Emotion>> {
    if labels.len() != NUM_CLASSES {
        anyhow::bail!(
            "ラベル数が不正です: {} (期待: {})",
            labels.len(),
            NUM_CLASSES
        );
    }

    let mut seen = HashSet::with_capacity(NUM_CLASSES);
    let mut mapping = Vec::with_capacity(NUM_CLASSES);
    for label in labels {
        let emotion: Emotion = label.parse()?;
        if !seen.insert(emotion) {
            anyhow::bail!("ラベルが重複しています: {}", emotion);
        }
        mapping.push(emotion);
    }

    Ok(mapping)
}

/// 推論結果
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub emotion: Emotion,
    pub confidence: f32,
}
