//! PostgreSQL dialect: EXTRACT/to_char conversion projections.

use serde_json::Value;

use super::{Conversion, ConversionUnit, Dialect};
use crate::types::SqlType;

pub struct PostgresDialect;

impl Dialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgresql"
    }

    fn render_ifnull(&self, expr: &str, fallback: &str) -> String {
        format!("COALESCE({expr}, {fallback})")
    }

    fn render_literal(&self, value: &Value) -> String {
        match value {
            Value::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
            other => default_literal(self, other),
        }
    }

    fn conversions(&self) -> &'static [Conversion] {
        POSTGRES_CONVERSIONS
    }
}

fn default_literal(dialect: &dyn Dialect, value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(|v| dialect.render_literal(v)).collect();
            rendered.join(", ")
        }
        other => format!("'{}'", other.to_string().replace('\'', "''")),
    }
}

static POSTGRES_CONVERSIONS: &[Conversion] = &[
    Conversion {
        name: "year",
        sa_type: SqlType::SmallInt,
        template: "CAST(EXTRACT(YEAR FROM {}) AS INTEGER)",
        datetime_only: false,
        unit: Some(ConversionUnit::Year),
    },
    Conversion {
        name: "quarter",
        sa_type: SqlType::VarChar(Some(8)),
        template: "to_char({}, 'YYYY') || '-Q' || EXTRACT(QUARTER FROM {})",
        datetime_only: false,
        unit: None,
    },
    Conversion {
        name: "quarter_of_year",
        sa_type: SqlType::SmallInt,
        template: "CAST(EXTRACT(QUARTER FROM {}) AS INTEGER)",
        datetime_only: false,
        unit: None,
    },
    Conversion {
        name: "month",
        sa_type: SqlType::VarChar(Some(8)),
        template: "to_char({}, 'YYYY-MM')",
        datetime_only: false,
        unit: Some(ConversionUnit::Month),
    },
    Conversion {
        name: "month_name",
        sa_type: SqlType::VarChar(Some(10)),
        template: "trim(to_char({}, 'Month'))",
        datetime_only: false,
        unit: None,
    },
    Conversion {
        name: "month_of_year",
        sa_type: SqlType::SmallInt,
        template: "CAST(EXTRACT(MONTH FROM {}) AS INTEGER)",
        datetime_only: false,
        unit: None,
    },
    Conversion {
        name: "week_of_year",
        sa_type: SqlType::SmallInt,
        template: "CAST(EXTRACT(WEEK FROM {}) AS INTEGER)",
        datetime_only: false,
        unit: None,
    },
    Conversion {
        name: "date",
        sa_type: SqlType::VarChar(Some(10)),
        template: "to_char({}, 'YYYY-MM-DD')",
        datetime_only: false,
        unit: Some(ConversionUnit::Date),
    },
    Conversion {
        name: "day_name",
        sa_type: SqlType::VarChar(Some(10)),
        template: "trim(to_char({}, 'Day'))",
        datetime_only: false,
        unit: None,
    },
    Conversion {
        name: "day_of_week",
        sa_type: SqlType::SmallInt,
        template: "CAST(EXTRACT(ISODOW FROM {}) AS INTEGER)",
        datetime_only: false,
        unit: None,
    },
    Conversion {
        name: "is_weekday",
        sa_type: SqlType::SmallInt,
        template: "CASE WHEN EXTRACT(ISODOW FROM {}) < 6 THEN 1 ELSE 0 END",
        datetime_only: false,
        unit: None,
    },
    Conversion {
        name: "day_of_month",
        sa_type: SqlType::SmallInt,
        template: "CAST(EXTRACT(DAY FROM {}) AS INTEGER)",
        datetime_only: false,
        unit: None,
    },
    Conversion {
        name: "day_of_year",
        sa_type: SqlType::SmallInt,
        template: "CAST(EXTRACT(DOY FROM {}) AS INTEGER)",
        datetime_only: false,
        unit: None,
    },
    Conversion {
        name: "hour",
        sa_type: SqlType::VarChar(Some(20)),
        template: "to_char({}, 'YYYY-MM-DD HH24:00:00')",
        datetime_only: true,
        unit: Some(ConversionUnit::Hour),
    },
    Conversion {
        name: "hour_of_day",
        sa_type: SqlType::SmallInt,
        template: "CAST(EXTRACT(HOUR FROM {}) AS INTEGER)",
        datetime_only: true,
        unit: None,
    },
    Conversion {
        name: "minute",
        sa_type: SqlType::VarChar(Some(20)),
        template: "to_char({}, 'YYYY-MM-DD HH24:MI:00')",
        datetime_only: true,
        unit: Some(ConversionUnit::Minute),
    },
    Conversion {
        name: "minute_of_hour",
        sa_type: SqlType::SmallInt,
        template: "CAST(EXTRACT(MINUTE FROM {}) AS INTEGER)",
        datetime_only: true,
        unit: None,
    },
    Conversion {
        name: "datetime",
        sa_type: SqlType::VarChar(Some(20)),
        template: "to_char({}, 'YYYY-MM-DD HH24:MI:SS')",
        datetime_only: true,
        unit: Some(ConversionUnit::Datetime),
    },
    Conversion {
        name: "unixtime",
        sa_type: SqlType::BigInt,
        template: "CAST(EXTRACT(EPOCH FROM {}) AS BIGINT)",
        datetime_only: true,
        unit: None,
    },
];
