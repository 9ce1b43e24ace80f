use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

/// 1-decimal display rounding carried over from the portal UI:
/// `floor(10*x + 0.5) / 10`. Applied only at the view boundary; aggregate
/// values keep full precision so sorting and comparisons do not drift.
pub fn round_off_1_decimal(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawAnswer {
    pub question_id: String,
    #[serde(default)]
    pub question_text: String,
    /// Submitted value exactly as the student sent it: a number, a numeric
    /// string, free text, or null.
    #[serde(default)]
    pub response: serde_json::Value,
    #[serde(default)]
    pub comments: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawFeedbackResponse {
    pub response_id: String,
    #[serde(default)]
    pub submitted_at: String,
    #[serde(default)]
    pub answers: Vec<RawAnswer>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionResponse {
    pub question_id: String,
    pub question_text: String,
    pub rating: Option<f64>,
    pub text_response: Option<String>,
    pub student_anon_id: String,
    pub submitted_at: String,
}

/// "Student A" .. "Student Z", then "Student A1" .. "Student Z1", and so on.
/// The index is per submission, not per answer, so every answer in one
/// submission shares the same label.
pub fn anon_label(index: usize) -> String {
    let letter = (b'A' + (index % 26) as u8) as char;
    let wrap = index / 26;
    if wrap > 0 {
        format!("Student {}{}", letter, wrap)
    } else {
        format!("Student {}", letter)
    }
}

fn parse_rating(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        serde_json::Value::String(s) => {
            let t = s.trim();
            if t.is_empty() {
                return None;
            }
            t.parse::<f64>().ok().filter(|v| v.is_finite())
        }
        _ => None,
    }
}

fn clean_text(raw: Option<&str>) -> Option<String> {
    let t = raw?.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}

/// Flattens raw submissions into one row per (submission, answer) pair.
///
/// Answers without a question id cannot be grouped and are dropped. A
/// non-numeric response string is kept as the text response when the answer
/// carries no comment, so free text typed into a rating field survives into
/// the drilldown view.
pub fn normalize(raw: &[RawFeedbackResponse]) -> Vec<QuestionResponse> {
    let mut out = Vec::new();
    for (i, submission) in raw.iter().enumerate() {
        let anon = anon_label(i);
        for answer in &submission.answers {
            if answer.question_id.trim().is_empty() {
                continue;
            }
            let rating = parse_rating(&answer.response);
            let text_response = clean_text(answer.comments.as_deref()).or_else(|| {
                if rating.is_none() {
                    clean_text(answer.response.as_str())
                } else {
                    None
                }
            });
            let question_text = if answer.question_text.trim().is_empty() {
                format!("Question {}", answer.question_id)
            } else {
                answer.question_text.clone()
            };
            out.push(QuestionResponse {
                question_id: answer.question_id.clone(),
                question_text,
                rating,
                text_response,
                student_anon_id: anon.clone(),
                submitted_at: submission.submitted_at.clone(),
            });
        }
    }
    out
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    pub label: String,
    pub min_inclusive: f64,
}

/// Ordered rating buckets, highest threshold first. The table is injected
/// rather than scattered as literals so a rubric change touches one place.
#[derive(Debug, Clone)]
pub struct BucketTable {
    buckets: Vec<Bucket>,
}

impl BucketTable {
    pub fn new(mut buckets: Vec<Bucket>) -> Self {
        buckets.sort_by(|a, b| {
            b.min_inclusive
                .partial_cmp(&a.min_inclusive)
                .unwrap_or(Ordering::Equal)
        });
        Self { buckets }
    }

    pub fn labels(&self) -> Vec<String> {
        self.buckets.iter().map(|b| b.label.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Index of the first bucket whose threshold the rating meets. None only
    /// when a custom table leaves the low end uncovered.
    pub fn classify(&self, rating: f64) -> Option<usize> {
        self.buckets.iter().position(|b| rating >= b.min_inclusive)
    }
}

impl Default for BucketTable {
    fn default() -> Self {
        Self::new(vec![
            Bucket {
                label: "Excellent".to_string(),
                min_inclusive: 4.5,
            },
            Bucket {
                label: "Good".to_string(),
                min_inclusive: 3.5,
            },
            Bucket {
                label: "Average".to_string(),
                min_inclusive: 2.5,
            },
            Bucket {
                label: "Poor".to_string(),
                min_inclusive: f64::NEG_INFINITY,
            },
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RatingDistribution {
    pub labels: Vec<String>,
    pub counts: Vec<u64>,
}

impl RatingDistribution {
    /// Zero means "no rated responses yet"; the consumer renders an empty
    /// state rather than an all-zero chart.
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionAggregate {
    pub question_id: String,
    pub question_text: String,
    /// Full-precision mean of the rated responses; 0.0 when none are rated.
    pub average_rating: f64,
    /// Responses that carried a usable rating.
    pub response_count: usize,
    /// All responses to the question, rated or not.
    pub total_count: usize,
}

/// Buckets every rated response and groups per-question aggregates.
/// Question order is first-seen order in the normalized input; callers rely
/// on it for stable chart labels.
pub fn aggregate_ratings(
    normalized: &[QuestionResponse],
    buckets: &BucketTable,
) -> (RatingDistribution, Vec<QuestionAggregate>) {
    struct Group {
        question_id: String,
        question_text: String,
        sum: f64,
        rated: usize,
        total: usize,
    }

    let mut counts = vec![0u64; buckets.len()];
    let mut groups: Vec<Group> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for row in normalized {
        if let Some(rating) = row.rating {
            if let Some(idx) = buckets.classify(rating) {
                counts[idx] += 1;
            }
        }
        let slot = *index.entry(row.question_id.clone()).or_insert_with(|| {
            groups.push(Group {
                question_id: row.question_id.clone(),
                question_text: row.question_text.clone(),
                sum: 0.0,
                rated: 0,
                total: 0,
            });
            groups.len() - 1
        });
        let group = &mut groups[slot];
        group.total += 1;
        if let Some(rating) = row.rating {
            group.sum += rating;
            group.rated += 1;
        }
    }

    let aggregates = groups
        .into_iter()
        .map(|g| QuestionAggregate {
            question_id: g.question_id,
            question_text: g.question_text,
            average_rating: if g.rated > 0 {
                g.sum / (g.rated as f64)
            } else {
                0.0
            },
            response_count: g.rated,
            total_count: g.total,
        })
        .collect();

    (
        RatingDistribution {
            labels: buckets.labels(),
            counts,
        },
        aggregates,
    )
}

/// Mean of every non-null rating across all questions; 0.0 with no ratings.
pub fn overall_average(normalized: &[QuestionResponse]) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for row in normalized {
        if let Some(r) = row.rating {
            sum += r;
            count += 1;
        }
    }
    if count > 0 {
        sum / count as f64
    } else {
        0.0
    }
}

pub fn rated_count(normalized: &[QuestionResponse]) -> usize {
    normalized.iter().filter(|r| r.rating.is_some()).count()
}

/// Top `n` questions by full-precision average. Stable sort, so ties keep
/// first-seen order. Questions with no rated responses are excluded.
pub fn top_rated(aggregates: &[QuestionAggregate], n: usize) -> Vec<QuestionAggregate> {
    let mut ranked: Vec<QuestionAggregate> = aggregates
        .iter()
        .filter(|a| a.response_count > 0)
        .cloned()
        .collect();
    ranked.sort_by(|a, b| {
        b.average_rating
            .partial_cmp(&a.average_rating)
            .unwrap_or(Ordering::Equal)
    });
    ranked.truncate(n);
    ranked
}

pub fn needs_improvement(aggregates: &[QuestionAggregate], n: usize) -> Vec<QuestionAggregate> {
    let mut ranked: Vec<QuestionAggregate> = aggregates
        .iter()
        .filter(|a| a.response_count > 0)
        .cloned()
        .collect();
    ranked.sort_by(|a, b| {
        a.average_rating
            .partial_cmp(&b.average_rating)
            .unwrap_or(Ordering::Equal)
    });
    ranked.truncate(n);
    ranked
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Absent,
    Late,
    Excused,
}

impl AttendanceStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "present" => Some(Self::Present),
            "absent" => Some(Self::Absent),
            "late" => Some(Self::Late),
            "excused" => Some(Self::Excused),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Absent => "absent",
            Self::Late => "late",
            Self::Excused => "excused",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AttendeeMark {
    pub student_id: String,
    pub status: AttendanceStatus,
    pub remark: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RawAttendanceRecord {
    pub record_id: String,
    pub department: String,
    pub date: NaiveDate,
    pub attendees: Vec<AttendeeMark>,
}

/// Composite key: a day with records from two departments produces two
/// entries, never one merged bucket. Summing across departments is the
/// caller's explicit choice.
pub type DayKey = (NaiveDate, String);

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceDayAggregate {
    pub present: u64,
    pub absent: u64,
    pub late: u64,
    pub excused: u64,
    pub total: u64,
}

impl AttendanceDayAggregate {
    fn add(&mut self, status: AttendanceStatus) {
        match status {
            AttendanceStatus::Present => self.present += 1,
            AttendanceStatus::Absent => self.absent += 1,
            AttendanceStatus::Late => self.late += 1,
            AttendanceStatus::Excused => self.excused += 1,
        }
        self.total += 1;
    }

    pub fn accumulate(&mut self, other: &AttendanceDayAggregate) {
        self.present += other.present;
        self.absent += other.absent;
        self.late += other.late;
        self.excused += other.excused;
        self.total += other.total;
    }

    /// Percentage of marked students who were present. A taken day with an
    /// empty roster reports 0.0; a day with no record has no aggregate at
    /// all and must render as "not taken".
    pub fn present_percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            100.0 * self.present as f64 / self.total as f64
        }
    }
}

/// Buckets attendee marks by (date, department). Days without a record get
/// no entry. Lookup per visible calendar day is a keyed get, not a re-scan.
pub fn aggregate_attendance(
    records: &[RawAttendanceRecord],
    filter_department: Option<&str>,
) -> BTreeMap<DayKey, AttendanceDayAggregate> {
    let filter = filter_department.map(str::trim).filter(|s| !s.is_empty());
    let mut out: BTreeMap<DayKey, AttendanceDayAggregate> = BTreeMap::new();
    for record in records {
        if let Some(dep) = filter {
            if record.department != dep {
                continue;
            }
        }
        let entry = out
            .entry((record.date, record.department.clone()))
            .or_default();
        for mark in &record.attendees {
            entry.add(mark.status);
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartSeries {
    pub labels: Vec<String>,
    pub data: Vec<f64>,
}

/// Distribution counts in bucket-table order. An all-zero series means "no
/// rated responses"; the consumer renders the empty state off total == 0.
pub fn build_chart_series(distribution: &RatingDistribution) -> ChartSeries {
    ChartSeries {
        labels: distribution.labels.clone(),
        data: distribution.counts.iter().map(|&c| c as f64).collect(),
    }
}

/// Question labels in first-seen order, averages rounded for display.
pub fn build_question_series(aggregates: &[QuestionAggregate]) -> ChartSeries {
    ChartSeries {
        labels: aggregates.iter().map(|a| a.question_text.clone()).collect(),
        data: aggregates
            .iter()
            .map(|a| round_off_1_decimal(a.average_rating))
            .collect(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrilldownGroup {
    pub question_id: String,
    pub question_text: String,
    pub responses: Vec<QuestionResponse>,
}

/// Groups normalized rows by question. A filter of None, "", or "all" keeps
/// every group; an id with no rows yields an empty list, not an error.
pub fn build_drilldown(
    normalized: &[QuestionResponse],
    filter_question_id: Option<&str>,
) -> Vec<DrilldownGroup> {
    let filter = filter_question_id
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("all"));

    let mut groups: Vec<DrilldownGroup> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for row in normalized {
        if let Some(wanted) = filter {
            if row.question_id != wanted {
                continue;
            }
        }
        let slot = *index.entry(row.question_id.clone()).or_insert_with(|| {
            groups.push(DrilldownGroup {
                question_id: row.question_id.clone(),
                question_text: row.question_text.clone(),
                responses: Vec::new(),
            });
            groups.len() - 1
        });
        groups[slot].responses.push(row.clone());
    }
    groups
}
