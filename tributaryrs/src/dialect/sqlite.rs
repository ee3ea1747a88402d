//! SQLite dialect: strftime-based conversion projections.

use super::{Conversion, ConversionUnit, Dialect};
use crate::types::SqlType;

#[derive(Clone)]
pub struct SqliteDialect;

impl Dialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn conversions(&self) -> &'static [Conversion] {
        SQLITE_CONVERSIONS
    }
}

static SQLITE_CONVERSIONS: &[Conversion] = &[
    Conversion {
        name: "year",
        sa_type: SqlType::SmallInt,
        template: "CAST(strftime('%Y', {}) AS INTEGER)",
        datetime_only: false,
        unit: Some(ConversionUnit::Year),
    },
    Conversion {
        name: "quarter",
        sa_type: SqlType::VarChar(Some(8)),
        template: "strftime('%Y', {}) || '-Q' || ((CAST(strftime('%m', {}) AS INTEGER) + 2) / 3)",
        datetime_only: false,
        unit: None,
    },
    Conversion {
        name: "quarter_of_year",
        sa_type: SqlType::SmallInt,
        template: "(CAST(strftime('%m', {}) AS INTEGER) + 2) / 3",
        datetime_only: false,
        unit: None,
    },
    Conversion {
        name: "month",
        sa_type: SqlType::VarChar(Some(8)),
        template: "strftime('%Y-%m', {})",
        datetime_only: false,
        unit: Some(ConversionUnit::Month),
    },
    Conversion {
        name: "month_name",
        sa_type: SqlType::VarChar(Some(10)),
        template: "CASE strftime('%m', {}) \
                   WHEN '01' THEN 'January' \
                   WHEN '02' THEN 'February' \
                   WHEN '03' THEN 'March' \
                   WHEN '04' THEN 'April' \
                   WHEN '05' THEN 'May' \
                   WHEN '06' THEN 'June' \
                   WHEN '07' THEN 'July' \
                   WHEN '08' THEN 'August' \
                   WHEN '09' THEN 'September' \
                   WHEN '10' THEN 'October' \
                   WHEN '11' THEN 'November' \
                   WHEN '12' THEN 'December' \
                   ELSE NULL END",
        datetime_only: false,
        unit: None,
    },
    Conversion {
        name: "month_of_year",
        sa_type: SqlType::SmallInt,
        template: "CAST(strftime('%m', {}) AS INTEGER)",
        datetime_only: false,
        unit: None,
    },
    Conversion {
        name: "week_of_year",
        sa_type: SqlType::SmallInt,
        template: "CAST(strftime('%W', {}) AS INTEGER) + 1",
        datetime_only: false,
        unit: None,
    },
    Conversion {
        name: "date",
        sa_type: SqlType::VarChar(Some(10)),
        template: "strftime('%Y-%m-%d', {})",
        datetime_only: false,
        unit: Some(ConversionUnit::Date),
    },
    Conversion {
        name: "day_name",
        sa_type: SqlType::VarChar(Some(10)),
        template: "CASE CAST(strftime('%w', {}) AS INTEGER) \
                   WHEN 0 THEN 'Sunday' \
                   WHEN 1 THEN 'Monday' \
                   WHEN 2 THEN 'Tuesday' \
                   WHEN 3 THEN 'Wednesday' \
                   WHEN 4 THEN 'Thursday' \
                   WHEN 5 THEN 'Friday' \
                   WHEN 6 THEN 'Saturday' \
                   ELSE NULL END",
        datetime_only: false,
        unit: None,
    },
    Conversion {
        // Monday = 1, matching ISO day-of-week.
        name: "day_of_week",
        sa_type: SqlType::SmallInt,
        template: "(CAST(strftime('%w', {}) AS INTEGER) + 6) % 7 + 1",
        datetime_only: false,
        unit: None,
    },
    Conversion {
        name: "is_weekday",
        sa_type: SqlType::SmallInt,
        template: "CASE CAST(strftime('%w', {}) AS INTEGER) \
                   WHEN 0 THEN 0 WHEN 6 THEN 0 ELSE 1 END",
        datetime_only: false,
        unit: None,
    },
    Conversion {
        name: "day_of_month",
        sa_type: SqlType::SmallInt,
        template: "CAST(strftime('%d', {}) AS INTEGER)",
        datetime_only: false,
        unit: None,
    },
    Conversion {
        name: "day_of_year",
        sa_type: SqlType::SmallInt,
        template: "CAST(strftime('%j', {}) AS INTEGER)",
        datetime_only: false,
        unit: None,
    },
    Conversion {
        name: "hour",
        sa_type: SqlType::VarChar(Some(20)),
        template: "strftime('%Y-%m-%d %H:00:00', {})",
        datetime_only: true,
        unit: Some(ConversionUnit::Hour),
    },
    Conversion {
        name: "hour_of_day",
        sa_type: SqlType::SmallInt,
        template: "CAST(strftime('%H', {}) AS INTEGER)",
        datetime_only: true,
        unit: None,
    },
    Conversion {
        name: "minute",
        sa_type: SqlType::VarChar(Some(20)),
        template: "strftime('%Y-%m-%d %H:%M:00', {})",
        datetime_only: true,
        unit: Some(ConversionUnit::Minute),
    },
    Conversion {
        name: "minute_of_hour",
        sa_type: SqlType::SmallInt,
        template: "CAST(strftime('%M', {}) AS INTEGER)",
        datetime_only: true,
        unit: None,
    },
    Conversion {
        name: "datetime",
        sa_type: SqlType::VarChar(Some(20)),
        template: "strftime('%Y-%m-%d %H:%M:%S', {})",
        datetime_only: true,
        unit: Some(ConversionUnit::Datetime),
    },
    Conversion {
        name: "unixtime",
        sa_type: SqlType::BigInt,
        template: "CAST(strftime('%s', {}) AS INTEGER)",
        datetime_only: true,
        unit: None,
    },
];
