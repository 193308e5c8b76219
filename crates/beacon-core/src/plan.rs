use std::fmt;

use serde::{Deserialize, Serialize};

/// One independently queried slice of upstream state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Health,
    Users,
    Services,
    Logs,
    Metrics,
}

impl Category {
    /// Fixed reporting order.
    pub const ALL: [Category; 5] = [
        Category::Health,
        Category::Users,
        Category::Services,
        Category::Logs,
        Category::Metrics,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Health => "health",
            Self::Users => "users",
            Self::Services => "services",
            Self::Logs => "logs",
            Self::Metrics => "metrics",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warning" | "warn" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

pub const DEFAULT_LOG_TIMEFRAME: &str = "1h";
pub const DEFAULT_LOG_LIMIT: u32 = 100;
pub const MAX_LOG_LIMIT: u32 = 10_000;

/// Parameters for the upstream log query.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogQuery {
    /// Window such as `"30m"`, `"1h"`, `"24h"`, `"7d"`.
    #[serde(default = "default_timeframe")]
    pub timeframe: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<LogLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_timeframe() -> String {
    DEFAULT_LOG_TIMEFRAME.to_string()
}

fn default_limit() -> u32 {
    DEFAULT_LOG_LIMIT
}

impl Default for LogQuery {
    fn default() -> Self {
        Self {
            timeframe: default_timeframe(),
            level: None,
            service: None,
            search: None,
            limit: DEFAULT_LOG_LIMIT,
        }
    }
}

impl LogQuery {
    /// Same query with `limit` forced into `1..=MAX_LOG_LIMIT`.
    pub fn clamped(mut self) -> Self {
        self.limit = self.limit.clamp(1, MAX_LOG_LIMIT);
        self
    }
}

/// Which categories to fetch, plus the log query parameters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationPlan {
    pub health: bool,
    pub users: bool,
    pub services: bool,
    pub logs: bool,
    pub metrics: bool,
    #[serde(default)]
    pub log_query: LogQuery,
}

impl AggregationPlan {
    /// Every category with a default log query.
    pub fn all() -> Self {
        Self::from_categories(Category::ALL)
    }

    /// Build a plan from a set of categories. Duplicates and order are irrelevant.
    pub fn from_categories(categories: impl IntoIterator<Item = Category>) -> Self {
        categories
            .into_iter()
            .fold(Self::default(), |plan, c| plan.with(c))
    }

    pub fn with(mut self, category: Category) -> Self {
        *self.flag_mut(category) = true;
        self
    }

    pub fn with_log_query(mut self, query: LogQuery) -> Self {
        self.log_query = query;
        self
    }

    pub fn includes(&self, category: Category) -> bool {
        match category {
            Category::Health => self.health,
            Category::Users => self.users,
            Category::Services => self.services,
            Category::Logs => self.logs,
            Category::Metrics => self.metrics,
        }
    }

    /// Requested categories in reporting order.
    pub fn categories(&self) -> Vec<Category> {
        Category::ALL
            .into_iter()
            .filter(|c| self.includes(*c))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.categories().is_empty()
    }

    fn flag_mut(&mut self, category: Category) -> &mut bool {
        match category {
            Category::Health => &mut self.health,
            Category::Users => &mut self.users,
            Category::Services => &mut self.services,
            Category::Logs => &mut self.logs,
            Category::Metrics => &mut self.metrics,
        }
    }
}
