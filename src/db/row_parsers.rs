use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::errors::PermissionError;
use crate::models::permission::PermissionRecord;

fn column<T>(row: &SqliteRow, name: &str) -> Result<T, PermissionError>
where
    T: for<'r> sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(name)
        .map_err(|e| PermissionError::store_unavailable(format!("missing {}: {}", name, e)))
}

/// Rows written by older tooling may carry NULL or blank resource/action
/// columns; those come back as empty strings and are left for the
/// canonicalizer to normalize.
pub fn permission_record_from_row(row: &SqliteRow) -> Result<PermissionRecord, PermissionError> {
    let role_id: String = column(row, "role_id")?;
    let resource: Option<String> = column(row, "resource")?;
    let action: Option<String> = column(row, "action")?;
    let allowed: bool = column(row, "allowed")?;

    Ok(PermissionRecord {
        role_id,
        resource: resource.unwrap_or_default(),
        action: action.unwrap_or_default(),
        allowed,
    })
}
