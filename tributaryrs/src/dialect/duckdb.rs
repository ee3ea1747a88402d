//! DuckDB dialect: strftime/EXTRACT conversion projections.

use super::{Conversion, ConversionUnit, Dialect};
use crate::types::SqlType;

pub struct DuckDbDialect;

impl Dialect for DuckDbDialect {
    fn name(&self) -> &'static str {
        "duckdb"
    }

    fn conversions(&self) -> &'static [Conversion] {
        DUCKDB_CONVERSIONS
    }
}

static DUCKDB_CONVERSIONS: &[Conversion] = &[
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
        template: "strftime({}, '%Y-Q') || date_part('quarter', {})",
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
        template: "strftime({}, '%Y-%m')",
        datetime_only: false,
        unit: Some(ConversionUnit::Month),
    },
    Conversion {
        name: "month_name",
        sa_type: SqlType::VarChar(Some(10)),
        template: "strftime({}, '%B')",
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
        template: "strftime({}, '%Y-%m-%d')",
        datetime_only: false,
        unit: Some(ConversionUnit::Date),
    },
    Conversion {
        name: "day_name",
        sa_type: SqlType::VarChar(Some(10)),
        template: "strftime({}, '%A')",
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
        template: "strftime({}, '%Y-%m-%d %H:00:00')",
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
        template: "strftime({}, '%Y-%m-%d %H:%M:00')",
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
        template: "strftime({}, '%Y-%m-%d %H:%M:%S')",
        datetime_only: true,
        unit: Some(ConversionUnit::Datetime),
    },
    Conversion {
        name: "unixtime",
        sa_type: SqlType::BigInt,
        template: "CAST(epoch({}) AS BIGINT)",
        datetime_only: true,
        unit: None,
    },
];
