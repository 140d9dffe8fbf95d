use std::fmt;

use bytes::Buf;

use crate::error::{PgWireError, Result};

/// Fields of an ErrorResponse or NoticeResponse.
///
/// Only the fields a replication client acts on are kept; unknown field
/// codes are skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorFields {
    /// `S`/`V`: severity, preferring the non-localized `V` field.
    pub severity: Option<String>,
    /// `C`: SQLSTATE.
    pub code: Option<String>,
    /// `M`: primary message.
    pub message: Option<String>,
    /// `D`: detail.
    pub detail: Option<String>,
    /// `H`: hint.
    pub hint: Option<String>,
}

impl ErrorFields {
    /// Parse `(code_byte, cstring)* \0`.
    pub fn parse(payload: &[u8]) -> ErrorFields {
        let mut fields = ErrorFields::default();
        let mut b = payload;

        while let Some((&code, rest)) = b.split_first() {
            if code == 0 {
                break;
            }
            let Some(pos) = rest.iter().position(|&x| x == 0) else {
                break;
            };
            let s = String::from_utf8_lossy(&rest[..pos]).into_owned();
            match code {
                b'V' => fields.severity = Some(s),
                b'S' if fields.severity.is_none() => fields.severity = Some(s),
                b'C' => fields.code = Some(s),
                b'M' => fields.message = Some(s),
                b'D' => fields.detail = Some(s),
                b'H' => fields.hint = Some(s),
                _ => {}
            }
            b = &rest[pos + 1..];
        }

        fields
    }
}

impl fmt::Display for ErrorFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.message, &self.code) {
            (Some(m), Some(c)) => write!(f, "{m} (SQLSTATE {c})")?,
            (Some(m), None) => f.write_str(m)?,
            _ => f.write_str("unknown server error")?,
        }
        if let Some(d) = &self.detail {
            write!(f, ": {d}")?;
        }
        Ok(())
    }
}

/// Column names from a RowDescription (`T`) message.
pub fn parse_row_description(payload: &[u8]) -> Result<Vec<String>> {
    let mut b = payload;
    if b.remaining() < 2 {
        return Err(PgWireError::Protocol("RowDescription too short".into()));
    }
    let count = b.get_i16();
    if count < 0 {
        return Err(PgWireError::Protocol(format!(
            "RowDescription with negative field count: {count}"
        )));
    }

    let mut names = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name = read_cstr(&mut b, "RowDescription")?;
        // table oid(4) + attnum(2) + type oid(4) + typlen(2) + typmod(4) + format(2)
        if b.remaining() < 18 {
            return Err(PgWireError::Protocol("RowDescription field truncated".into()));
        }
        b.advance(18);
        names.push(name);
    }
    Ok(names)
}

/// Text values from a DataRow (`D`) message; `None` is SQL NULL.
pub fn parse_data_row(payload: &[u8]) -> Result<Vec<Option<String>>> {
    let mut b = payload;
    if b.remaining() < 2 {
        return Err(PgWireError::Protocol("DataRow too short".into()));
    }
    let count = b.get_i16();
    if count < 0 {
        return Err(PgWireError::Protocol(format!(
            "DataRow with negative column count: {count}"
        )));
    }

    let mut values = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if b.remaining() < 4 {
            return Err(PgWireError::Protocol("DataRow column truncated".into()));
        }
        let len = b.get_i32();
        if len < 0 {
            values.push(None);
            continue;
        }
        let len = len as usize;
        if b.remaining() < len {
            return Err(PgWireError::Protocol(format!(
                "DataRow value truncated: need {len}, have {}",
                b.remaining()
            )));
        }
        values.push(Some(String::from_utf8_lossy(&b[..len]).into_owned()));
        b.advance(len);
    }
    Ok(values)
}

/// Command tag from a CommandComplete (`C`) message.
pub fn parse_command_complete(payload: &[u8]) -> Result<String> {
    let mut b = payload;
    read_cstr(&mut b, "CommandComplete")
}

/// Transaction status byte from ReadyForQuery (`Z`): `I`, `T` or `E`.
pub fn parse_ready_for_query(payload: &[u8]) -> Result<u8> {
    match payload {
        [status] => Ok(*status),
        _ => Err(PgWireError::Protocol(format!(
            "ReadyForQuery with {} byte payload",
            payload.len()
        ))),
    }
}

fn read_cstr(b: &mut &[u8], what: &str) -> Result<String> {
    let pos = b
        .iter()
        .position(|&x| x == 0)
        .ok_or_else(|| PgWireError::Protocol(format!("{what}: unterminated string")))?;
    let s = String::from_utf8_lossy(&(*b)[..pos]).into_owned();
    b.advance(pos + 1);
    Ok(s)
}
