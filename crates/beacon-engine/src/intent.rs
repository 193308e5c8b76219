//! Free-text query classification.
//!
//! Turns an English or Vietnamese request such as "check error logs from the
//! last 2 hours" into an [`AggregationPlan`]. Pure pattern matching: no
//! network access, no state between calls.

use regex::{Regex, RegexSet};
use serde::Serialize;
use tracing::{debug, info};

use beacon_core::{AggregationPlan, Category, LogLevel, LogQuery};

const HEALTH: &[&str] = &[
    r"(kiểm tra|check).*(hệ thống|system|health|sức khỏe)",
    r"(health|sức khỏe).*(hệ thống|system)",
    r"(status|trạng thái).*(hệ thống|system)",
    r"hệ thống.*(hoạt động|running|ok)",
    r"(check|verify).*(system|health)",
    r"(system|server).*(health|status)",
    r"is.*(system|server).*(up|running|healthy)",
];

const USERS: &[&str] = &[
    r"(người dùng|user).*(status|trạng thái|đang|online)",
    r"(kiểm tra|check).*(user|người dùng|account|tài khoản)",
    r"(ai|who).*(đang|currently).*(online|active)",
    r"số lượng.*(user|người dùng)",
    r"(user|users).*(status|active|online)",
    r"(check|list).*(user|users|account)",
    r"who.*(online|active|logged in)",
    r"(how many|count).*(user|users)",
];

const SERVICES: &[&str] = &[
    r"(dịch vụ|service).*(nào|list|danh sách)",
    r"(kiểm tra|check).*(service|dịch vụ|api)",
    r"các.*(service|dịch vụ).*(đang chạy|running)",
    r"danh sách.*(service|dịch vụ)",
    r"(service|services).*(list|available|running)",
    r"(check|list).*(service|services|api)",
    r"what.*(service|services).*(running|available)",
    r"(show|get).*(service|services)",
];

const LOGS: &[&str] = &[
    r"(log|nhật ký|lịch sử).*(gần đây|recent|latest)",
    r"(kiểm tra|check|xem).*(log|nhật ký)",
    r"(error|lỗi).*(log|nhật ký)",
    r"(tìm|search).*(log|nhật ký)",
    r"(log|logs).*(recent|latest|last)",
    r"(check|view|show).*(log|logs)",
    r"(error|warning).*(log|logs)",
    r"(search|find).*(log|logs)",
];

const METRICS: &[&str] = &[
    r"(metric|chỉ số|số liệu).*(hiện tại|current|now)",
    r"(hiệu suất|performance).*(hệ thống|system)",
    r"(cpu|memory|ram|disk).*(usage|sử dụng)",
    r"(kiểm tra|check).*(metric|chỉ số|performance)",
    r"(metric|metrics).*(current|now|latest)",
    r"(system|server).*(performance|metric)",
    r"(cpu|memory|disk|network).*(usage|utilization)",
    r"(check|show).*(metric|metrics|performance)",
];

const ALL: &[&str] = &[
    r"(kiểm tra|check).*(toàn bộ|tất cả|all|everything)",
    r"(toàn bộ|tất cả).*(hệ thống|system)",
    r"(overview|tổng quan).*(hệ thống|system)",
    r"full.*(check|scan)",
    r"(check|scan).*(all|everything|full)",
    r"(full|complete).*(system|check|scan)",
    r"(system|server).*(overview|summary)",
    r"everything",
];

/// Timeframe rules, first match wins.
const TIMEFRAMES: &[(&str, Timeframe)] = &[
    (r"(\d+)\s*(phút|minute|min)", Timeframe::Scaled('m')),
    (r"(\d+)\s*(giờ|hour|h)", Timeframe::Scaled('h')),
    (r"(\d+)\s*(ngày|day|d)", Timeframe::Scaled('d')),
    (r"1\s*(tuần|week|w)", Timeframe::Fixed("7d")),
    (r"hôm nay|today", Timeframe::Fixed("24h")),
    (r"gần đây|recent|latest", Timeframe::Fixed("1h")),
];

const LEVELS: &[(&str, LogLevel)] = &[
    (r"(error|lỗi)", LogLevel::Error),
    (r"(warning|cảnh báo)", LogLevel::Warning),
    (r"(info|thông tin)", LogLevel::Info),
    (r"debug", LogLevel::Debug),
    (r"(critical|nghiêm trọng)", LogLevel::Critical),
];

const SERVICE_NAMES: &[&str] = &[
    r"service[=:\s]+([a-zA-Z0-9_-]+)",
    r"from\s+([a-zA-Z0-9_-]+)\s+service",
    r"của\s+([a-zA-Z0-9_-]+)",
];

const SEARCH_TERMS: &[&str] = &[
    r#"search\s+(?:for\s+)?['"]?([^'"]+)['"]?"#,
    r#"tìm\s+['"]?([^'"]+)['"]?"#,
    r#"find\s+['"]?([^'"]+)['"]?"#,
];

#[derive(Clone, Copy, Debug)]
enum Timeframe {
    /// Captured count followed by this unit suffix.
    Scaled(char),
    Fixed(&'static str),
}

/// Classifier output.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ParsedIntent {
    pub plan: AggregationPlan,
    pub confidence: f64,
    pub original_query: String,
}

impl ParsedIntent {
    pub fn categories(&self) -> Vec<Category> {
        self.plan.categories()
    }
}

pub struct IntentExtractor {
    all: RegexSet,
    categories: Vec<(Category, RegexSet)>,
    timeframes: Vec<(Regex, Timeframe)>,
    levels: Vec<(Regex, LogLevel)>,
    service_names: Vec<Regex>,
    search_terms: Vec<Regex>,
}

fn case_insensitive(pattern: &str) -> String {
    format!("(?i){pattern}")
}

fn set(patterns: &[&str]) -> Result<RegexSet, regex::Error> {
    RegexSet::new(patterns.iter().map(|p| case_insensitive(p)))
}

fn compile(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&case_insensitive(pattern))
}

impl IntentExtractor {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            all: set(ALL)?,
            categories: vec![
                (Category::Health, set(HEALTH)?),
                (Category::Users, set(USERS)?),
                (Category::Services, set(SERVICES)?),
                (Category::Logs, set(LOGS)?),
                (Category::Metrics, set(METRICS)?),
            ],
            timeframes: TIMEFRAMES
                .iter()
                .map(|(p, t)| compile(p).map(|re| (re, *t)))
                .collect::<Result<_, _>>()?,
            levels: LEVELS
                .iter()
                .map(|(p, l)| compile(p).map(|re| (re, *l)))
                .collect::<Result<_, _>>()?,
            service_names: SERVICE_NAMES.iter().map(|p| compile(p)).collect::<Result<_, _>>()?,
            search_terms: SEARCH_TERMS.iter().map(|p| compile(p)).collect::<Result<_, _>>()?,
        })
    }

    pub fn parse(&self, query: &str) -> ParsedIntent {
        let text = query.trim().to_lowercase();

        if self.all.is_match(&text) {
            info!(query, "intent: full system check");
            return ParsedIntent {
                plan: AggregationPlan::all(),
                confidence: 0.95,
                original_query: query.to_string(),
            };
        }

        let matched: Vec<Category> = self
            .categories
            .iter()
            .filter(|(_, patterns)| patterns.is_match(&text))
            .map(|(category, _)| *category)
            .collect();

        let (mut plan, confidence) = if matched.is_empty() {
            debug!(query, "no intent pattern matched, defaulting to health");
            (AggregationPlan::from_categories([Category::Health]), 0.3)
        } else {
            let confidence = (0.5 + 0.15 * matched.len() as f64).min(0.9);
            (AggregationPlan::from_categories(matched), confidence)
        };

        if plan.logs {
            plan.log_query = self.log_query(&text);
        }

        info!(query, categories = ?plan.categories(), confidence, "intent parsed");
        ParsedIntent {
            plan,
            confidence,
            original_query: query.to_string(),
        }
    }

    fn log_query(&self, text: &str) -> LogQuery {
        LogQuery {
            timeframe: self.timeframe(text),
            level: self
                .levels
                .iter()
                .find(|(re, _)| re.is_match(text))
                .map(|(_, level)| *level),
            service: first_capture(&self.service_names, text),
            search: first_capture(&self.search_terms, text),
            ..LogQuery::default()
        }
    }

    fn timeframe(&self, text: &str) -> String {
        for (re, rule) in &self.timeframes {
            let Some(caps) = re.captures(text) else {
                continue;
            };
            return match rule {
                Timeframe::Fixed(value) => (*value).to_string(),
                Timeframe::Scaled(unit) => match caps.get(1) {
                    Some(n) => format!("{}{unit}", n.as_str()),
                    None => continue,
                },
            };
        }
        beacon_core::plan::DEFAULT_LOG_TIMEFRAME.to_string()
    }
}

fn first_capture(patterns: &[Regex], text: &str) -> Option<String> {
    patterns
        .iter()
        .find_map(|re| re.captures(text))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}
