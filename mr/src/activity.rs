//! Activities are the units of work the orchestrator schedules through the
//! host. Mapper, shuffler and reducer bodies are pure functions of their
//! input so a redelivered activity always produces the same output.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::types::{GroupedEntry, InputRecord, MapperOutput, ReducedEntry, WordCount};

static WORD_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z']+").expect("valid word pattern"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activity {
    ResolveInput {
        container: Option<String>,
        blobs: Option<Vec<String>>,
    },
    Map(InputRecord),
    Shuffle(Vec<MapperOutput>),
    Reduce(GroupedEntry),
}

impl Activity {
    pub fn name(&self) -> &'static str {
        match self {
            Activity::ResolveInput { .. } => "GetInputData",
            Activity::Map(_) => "Mapper",
            Activity::Shuffle(_) => "Shuffler",
            Activity::Reduce(_) => "Reducer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityOutput {
    Input(Vec<InputRecord>),
    Mapped(MapperOutput),
    Shuffled(Vec<GroupedEntry>),
    Reduced(ReducedEntry),
}

impl ActivityOutput {
    pub fn kind(&self) -> &'static str {
        match self {
            ActivityOutput::Input(_) => "Input",
            ActivityOutput::Mapped(_) => "Mapped",
            ActivityOutput::Shuffled(_) => "Shuffled",
            ActivityOutput::Reduced(_) => "Reduced",
        }
    }
}

/// Lowercased maximal runs of ASCII letters and apostrophes.
pub fn tokenize(line: &str) -> Vec<String> {
    WORD_PATTERN
        .find_iter(line)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

pub fn map_record(record: &InputRecord) -> MapperOutput {
    tokenize(&record.line)
        .into_iter()
        .map(|word| WordCount { word, count: 1 })
        .collect()
}

/// Groups counts by word across every mapper output. Words come out in
/// order of first appearance.
pub fn shuffle(outputs: &[MapperOutput]) -> Vec<GroupedEntry> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut grouped: Vec<GroupedEntry> = vec![];
    for pair in outputs.iter().flatten() {
        match index.get(pair.word.as_str()) {
            Some(&i) => grouped[i].counts.push(pair.count),
            None => {
                index.insert(&pair.word, grouped.len());
                grouped.push(GroupedEntry {
                    word: pair.word.clone(),
                    counts: vec![pair.count],
                });
            }
        }
    }
    grouped
}

pub fn reduce(entry: &GroupedEntry) -> ReducedEntry {
    ReducedEntry {
        word: entry.word.clone(),
        total: entry.counts.iter().sum(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(output: &MapperOutput) -> Vec<&str> {
        output.iter().map(|p| p.word.as_str()).collect()
    }

    #[test]
    fn test_tokenize_case_folds_and_keeps_apostrophes() {
        assert_eq!(
            tokenize("The CAT's   hat, isn't it?"),
            vec!["the", "cat's", "hat", "isn't", "it"]
        );
    }

    #[test]
    fn test_punctuation_and_digits_yield_nothing() {
        assert!(tokenize("42 !! ---").is_empty());
        assert!(tokenize("").is_empty());
        assert!(map_record(&InputRecord::new(0, "")).is_empty());
    }

    #[test]
    fn test_non_ascii_letters_split_tokens() {
        assert_eq!(tokenize("café naïve"), vec!["caf", "na", "ve"]);
    }

    #[test]
    fn test_map_keeps_duplicates() {
        let output = map_record(&InputRecord::new(3, "the dog the"));
        assert_eq!(words(&output), vec!["the", "dog", "the"]);
        assert!(output.iter().all(|p| p.count == 1));
    }

    #[test]
    fn test_map_redelivery_is_identical() {
        let record = InputRecord::new(7, "Once more, with FEELING");
        let first = serde_json::to_vec(&map_record(&record)).unwrap();
        let second = serde_json::to_vec(&map_record(&record)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_shuffle_merges_across_partitions() {
        let outputs = vec![
            map_record(&InputRecord::new(0, "the cat sat")),
            map_record(&InputRecord::new(1, "the dog sat")),
            map_record(&InputRecord::new(2, "The CAT ran")),
        ];
        let grouped = shuffle(&outputs);
        let got: Vec<(&str, usize)> = grouped
            .iter()
            .map(|g| (g.word.as_str(), g.counts.len()))
            .collect();
        assert_eq!(
            got,
            vec![("the", 3), ("cat", 2), ("sat", 2), ("dog", 1), ("ran", 1)]
        );
    }

    #[test]
    fn test_shuffle_empty() {
        assert!(shuffle(&[]).is_empty());
        assert!(shuffle(&[vec![], vec![]]).is_empty());
    }

    #[test]
    fn test_reduce_sums_and_is_stable() {
        let entry = GroupedEntry {
            word: "sat".to_string(),
            counts: vec![1, 1, 1],
        };
        assert_eq!(reduce(&entry).total, 3);
        assert_eq!(reduce(&entry), reduce(&entry));

        let empty = GroupedEntry {
            word: "none".to_string(),
            counts: vec![],
        };
        assert_eq!(reduce(&empty).total, 0);
    }

    #[test]
    fn test_activity_names() {
        assert_eq!(Activity::Map(InputRecord::new(0, "")).name(), "Mapper");
        assert_eq!(Activity::Shuffle(vec![]).name(), "Shuffler");
        assert_eq!(
            Activity::ResolveInput {
                container: None,
                blobs: None
            }
            .name(),
            "GetInputData"
        );
    }
}
