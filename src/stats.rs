use serde::Serialize;

/// Two-decimal rounding used everywhere a rate or average leaves the daemon.
pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendanceStatus {
    Present,
    Absent,
    Late,
    Excused,
}

impl AttendanceStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "present" => Some(Self::Present),
            "absent" => Some(Self::Absent),
            "late" => Some(Self::Late),
            "excused" => Some(Self::Excused),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Absent => "absent",
            Self::Late => "late",
            Self::Excused => "excused",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradeCategory {
    Exam,
    Assignment,
    Project,
    Final,
}

impl GradeCategory {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "exam" => Some(Self::Exam),
            "assignment" => Some(Self::Assignment),
            "project" => Some(Self::Project),
            "final" => Some(Self::Final),
            _ => None,
        }
    }
}

/// One grade row as the aggregator sees it: already validated at entry time,
/// so score is 0..=100, max_score > 0 and weight is 0.0..=1.0.
#[derive(Debug, Clone, Copy)]
pub struct GradeRow {
    pub score: f64,
    pub max_score: f64,
    pub weight: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeSummary {
    pub weighted_average: f64,
    pub count: usize,
}

/// Weighted average over normalized scores: each row contributes
/// `score / max_score * 100` scaled by its weight, divided by the total
/// weight. No rows, or a total weight of zero, yields 0 rather than an error.
pub fn grade_summary<I>(rows: I) -> GradeSummary
where
    I: IntoIterator<Item = GradeRow>,
{
    let mut weighted_sum: f64 = 0.0;
    let mut weight_total: f64 = 0.0;
    let mut count: usize = 0;

    for row in rows {
        let normalized = if row.max_score > 0.0 {
            row.score / row.max_score * 100.0
        } else {
            0.0
        };
        weighted_sum += normalized * row.weight;
        weight_total += row.weight;
        count += 1;
    }

    let weighted_average = if weight_total > 0.0 {
        round2(weighted_sum / weight_total)
    } else {
        0.0
    };

    GradeSummary {
        weighted_average,
        count,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceStats {
    pub total: usize,
    pub present: usize,
    pub absent: usize,
    pub late: usize,
    pub excused: usize,
    // Legacy reporting mirror of `excused`; see the admin dashboard.
    pub justified: usize,
    pub rate: f64,
}

/// Group-count by status. `rate` is present/total*100 to two decimals, 0 when
/// there are no records at all.
pub fn attendance_stats<I>(statuses: I) -> AttendanceStats
where
    I: IntoIterator<Item = AttendanceStatus>,
{
    let mut total: usize = 0;
    let mut present: usize = 0;
    let mut absent: usize = 0;
    let mut late: usize = 0;
    let mut excused: usize = 0;

    for status in statuses {
        total += 1;
        match status {
            AttendanceStatus::Present => present += 1,
            AttendanceStatus::Absent => absent += 1,
            AttendanceStatus::Late => late += 1,
            AttendanceStatus::Excused => excused += 1,
        }
    }

    let rate = if total > 0 {
        round2(present as f64 / total as f64 * 100.0)
    } else {
        0.0
    };

    AttendanceStats {
        total,
        present,
        absent,
        late,
        excused,
        justified: excused,
        rate,
    }
}
