pub mod audit_event;
pub mod backup;
pub mod backup_schedule;
pub mod instance;

use rusqlite::Row;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(thiserror::Error, Debug)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Declares a state-like enum stored as TEXT.
macro_rules! text_enum {
    ($kind:literal, $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::models::UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err($crate::models::UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl rusqlite::types::ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
                Ok(rusqlite::types::ToSqlOutput::from(self.as_str()))
            }
        }

        impl rusqlite::types::FromSql for $name {
            fn column_result(
                value: rusqlite::types::ValueRef<'_>,
            ) -> rusqlite::types::FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e| rusqlite::types::FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

pub(crate) use text_enum;

/// Weak reference to a backed-up entity: a source type tag plus the
/// entity's uuid. Resolution goes through the strategy registered for the
/// tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackupSource {
    pub source_type: String,
    pub source_id: Uuid,
}

impl BackupSource {
    pub fn new(source_type: impl Into<String>, source_id: Uuid) -> Self {
        Self {
            source_type: source_type.into(),
            source_id,
        }
    }

    /// Reads the `source_type` / `source_id` column pair. Either column
    /// being NULL yields `None`.
    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Option<Self>> {
        let source_type: Option<String> = row.get("source_type")?;
        let source_id = crate::db::connection::get_opt_uuid(row, "source_id")?;
        Ok(match (source_type, source_id) {
            (Some(source_type), Some(source_id)) => Some(Self {
                source_type,
                source_id,
            }),
            _ => None,
        })
    }
}

impl fmt::Display for BackupSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source_type, self.source_id)
    }
}
