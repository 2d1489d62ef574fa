// 📊 Aggregates over the score relation
//
// Everything here is a pure function of a relation snapshot: nothing is
// cached, every call recomputes from the rows it is given.

use crate::db::{self, ScoreRecord};
use anyhow::Result;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

// ============================================================================
// RESULT TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectStat {
    pub subject: String,
    pub mean: f64,
    pub median: f64,
    pub stddev: f64,
    pub min: f64,
    pub max: f64,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentStat {
    pub student: String,
    pub mean: f64,
    pub median: f64,
    pub stddev: f64,
    pub min: f64,
    pub max: f64,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopPerformer {
    pub student: String,
    pub average: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectMean {
    pub subject: String,
    pub mean: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectExtremes {
    pub highest_subject: SubjectMean,
    pub lowest_subject: SubjectMean,
}

/// Descriptive statistics for one group of scores
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    pub mean: f64,
    pub median: f64,
    pub stddev: f64,
    pub min: f64,
    pub max: f64,
    pub count: usize,
}

impl Summary {
    /// Summarize a non-empty group. Sample stddev (n - 1), 0.0 for one value.
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }

        let count = values.len();
        let mean = values.iter().sum::<f64>() / count as f64;

        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);
        let mid = count / 2;
        let median = if count % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };

        let stddev = if count > 1 {
            let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (count - 1) as f64;
            variance.sqrt()
        } else {
            0.0
        };

        Some(Summary {
            mean,
            median,
            stddev,
            min: sorted[0],
            max: sorted[count - 1],
            count,
        })
    }
}

// ============================================================================
// RELATION & GROUPING
// ============================================================================

/// Snapshot of every score with its student and subject names
pub fn build_relation(conn: &Connection) -> Result<Vec<ScoreRecord>> {
    db::load_relation(conn)
}

/// Group scores by key; BTreeMap keeps keys ascending
fn group_by<F>(relation: &[ScoreRecord], key: F) -> BTreeMap<&str, Vec<f64>>
where
    F: Fn(&ScoreRecord) -> &str,
{
    let mut groups: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for record in relation {
        groups.entry(key(record)).or_default().push(record.score);
    }
    groups
}

fn group_summaries<F>(relation: &[ScoreRecord], key: F) -> Vec<(String, Summary)>
where
    F: Fn(&ScoreRecord) -> &str,
{
    group_by(relation, key)
        .into_iter()
        .filter_map(|(name, values)| Summary::from_values(&values).map(|s| (name.to_string(), s)))
        .collect()
}

// ============================================================================
// GROUPED STATISTICS
// ============================================================================

/// One entry per subject, ascending by subject name
pub fn per_subject_stats(relation: &[ScoreRecord]) -> Vec<SubjectStat> {
    group_summaries(relation, |r| r.subject_name.as_str())
        .into_iter()
        .map(|(subject, s)| SubjectStat {
            subject,
            mean: s.mean,
            median: s.median,
            stddev: s.stddev,
            min: s.min,
            max: s.max,
            count: s.count,
        })
        .collect()
}

/// One entry per student, ascending by student name
pub fn per_student_stats(relation: &[ScoreRecord]) -> Vec<StudentStat> {
    group_summaries(relation, |r| r.student_name.as_str())
        .into_iter()
        .map(|(student, s)| StudentStat {
            student,
            mean: s.mean,
            median: s.median,
            stddev: s.stddev,
            min: s.min,
            max: s.max,
            count: s.count,
        })
        .collect()
}

/// Per-subject means, highest first; equal means ordered by subject name
pub fn subject_means(relation: &[ScoreRecord]) -> Vec<SubjectMean> {
    let mut means: Vec<SubjectMean> = group_summaries(relation, |r| r.subject_name.as_str())
        .into_iter()
        .map(|(subject, s)| SubjectMean {
            subject,
            mean: s.mean,
        })
        .collect();

    means.sort_by(|a, b| b.mean.total_cmp(&a.mean).then_with(|| a.subject.cmp(&b.subject)));
    means
}

// Groups arrive name-ascending, so keeping the first of equal means picks the
// lexicographically smallest name.
fn pick<'a, T>(
    items: impl IntoIterator<Item = &'a (String, T)>,
    better: impl Fn(&T, &T) -> bool,
) -> Option<&'a (String, T)>
where
    T: 'a,
{
    items.into_iter().fold(None, |best, item| match best {
        Some(current) if !better(&item.1, &current.1) => Some(current),
        _ => Some(item),
    })
}

/// Student with the highest mean score; ties go to the smallest name
pub fn top_performer(relation: &[ScoreRecord]) -> Option<TopPerformer> {
    let summaries = group_summaries(relation, |r| r.student_name.as_str());

    pick(&summaries, |a: &Summary, b: &Summary| {
        a.mean.total_cmp(&b.mean) == Ordering::Greater
    })
    .map(|(student, s)| TopPerformer {
        student: student.clone(),
        average: s.mean,
    })
}

/// Subjects with the highest and lowest mean; ties go to the smallest name
pub fn subject_extremes(relation: &[ScoreRecord]) -> Option<SubjectExtremes> {
    let summaries = group_summaries(relation, |r| r.subject_name.as_str());

    let highest = pick(&summaries, |a: &Summary, b: &Summary| {
        a.mean.total_cmp(&b.mean) == Ordering::Greater
    })?;
    let lowest = pick(&summaries, |a: &Summary, b: &Summary| {
        a.mean.total_cmp(&b.mean) == Ordering::Less
    })?;

    Some(SubjectExtremes {
        highest_subject: SubjectMean {
            subject: highest.0.clone(),
            mean: highest.1.mean,
        },
        lowest_subject: SubjectMean {
            subject: lowest.0.clone(),
            mean: lowest.1.mean,
        },
    })
}
