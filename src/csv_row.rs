//! Row parsing: quote-aware line tokenizing and header-driven mapping of a
//! data row onto a [`CandidateRecord`].
//!
//! Both functions are pure. Column-count mismatches are the caller's concern;
//! [`parse_line`] returns however many fields the line contains.

use std::collections::BTreeMap;

use rust_decimal::Decimal;

use crate::error::IngestError;
use crate::models::CandidateRecord;

/// Splits one CSV line on commas outside double quotes.
///
/// A doubled quote inside a quoted span is a literal quote. An unterminated
/// quote runs to the end of the line. Each field is whitespace-trimmed.
pub fn parse_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                fields.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }

    fields.push(current.trim().to_string());
    fields
}

type Setter = fn(&mut CandidateRecord, &str) -> Result<(), String>;

/// Normalized header name to field setter. Headers not listed are ignored.
const COLUMNS: &[(&str, Setter)] = &[
    ("id", |r, v| {
        r.id = v.to_string();
        Ok(())
    }),
    ("name", |r, v| {
        r.name = v.to_string();
        Ok(())
    }),
    ("description", |r, v| {
        r.description = v.to_string();
        Ok(())
    }),
    ("price", |r, v| {
        r.price = parse_decimal(v)?;
        Ok(())
    }),
    ("originalprice", |r, v| {
        if !v.is_empty() {
            r.original_price = Some(parse_decimal(v)?);
        }
        Ok(())
    }),
    ("categoryid", |r, v| {
        r.category_id = v.to_string();
        Ok(())
    }),
    ("subcategoryid", |r, v| {
        r.subcategory_id = (!v.is_empty()).then(|| v.to_string());
        Ok(())
    }),
    ("brand", |r, v| {
        r.brand = v.to_string();
        Ok(())
    }),
    ("rating", |r, v| {
        let rating = v.parse::<f64>().map_err(|e| e.to_string())?;
        if !rating.is_finite() {
            return Err("must be a finite number".to_string());
        }
        r.rating = rating;
        Ok(())
    }),
    ("reviewcount", |r, v| {
        r.review_count = parse_int(v)?;
        Ok(())
    }),
    ("instock", |r, v| {
        r.in_stock = parse_bool(v)?;
        Ok(())
    }),
    ("stockcount", |r, v| {
        r.stock_count = parse_int(v)?;
        Ok(())
    }),
    ("images", |r, v| {
        r.images = parse_string_list(v);
        Ok(())
    }),
    ("features", |r, v| {
        r.features = parse_string_list(v);
        Ok(())
    }),
    ("specifications", |r, v| {
        r.specifications = parse_string_map(v);
        Ok(())
    }),
    ("tags", |r, v| {
        r.tags = parse_string_list(v);
        Ok(())
    }),
    ("sizes", |r, v| {
        if !v.is_empty() {
            r.sizes = Some(parse_string_list(v));
        }
        Ok(())
    }),
    ("colors", |r, v| {
        if !v.is_empty() {
            r.colors = Some(parse_string_list(v));
        }
        Ok(())
    }),
    ("isactive", |r, v| {
        r.is_active = parse_bool(v)?;
        Ok(())
    }),
];

fn setter_for(header: &str) -> Option<Setter> {
    COLUMNS
        .iter()
        .find(|(name, _)| *name == header)
        .map(|(_, setter)| *setter)
}

/// Maps a tokenized data row onto a candidate record.
///
/// Header matching ignores case and surrounding whitespace. Only the first
/// `min(headers, values)` pairs are considered.
pub fn map_row(
    headers: &[String],
    values: &[String],
    row_number: u64,
) -> Result<CandidateRecord, IngestError> {
    let mut record = CandidateRecord::default();

    for (header, value) in headers.iter().zip(values) {
        let header = header.trim().to_lowercase();
        let value = value.trim();
        let Some(set) = setter_for(&header) else {
            continue;
        };
        set(&mut record, value).map_err(|err| {
            IngestError::validation(
                row_number,
                format!(
                    "Invalid value '{}' for column '{}': {}",
                    value, header, err
                ),
            )
        })?;
    }

    let required = [
        (record.id.is_empty(), "Id is required"),
        (record.name.is_empty(), "Name is required"),
        (record.category_id.is_empty(), "CategoryId is required"),
        (record.brand.is_empty(), "Brand is required"),
    ];
    if let Some((_, message)) = required.into_iter().find(|(missing, _)| *missing) {
        return Err(IngestError::validation(row_number, message));
    }

    Ok(record)
}

fn parse_decimal(value: &str) -> Result<Decimal, String> {
    value
        .parse::<Decimal>()
        .or_else(|_| Decimal::from_scientific(value))
        .map_err(|e| e.to_string())
}

fn parse_int(value: &str) -> Result<i64, String> {
    value.parse::<i32>().map(i64::from).map_err(|e| e.to_string())
}

fn parse_bool(value: &str) -> Result<bool, String> {
    if value.eq_ignore_ascii_case("true") {
        Ok(true)
    } else if value.eq_ignore_ascii_case("false") {
        Ok(false)
    } else {
        Err("expected 'true' or 'false'".to_string())
    }
}

/// JSON string array, falling back to a comma-separated list.
fn parse_string_list(value: &str) -> Vec<String> {
    if value.is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<Option<Vec<String>>>(value) {
        Ok(list) => list.unwrap_or_default(),
        Err(_) => value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
    }
}

/// JSON string-to-string object, falling back to empty.
fn parse_string_map(value: &str) -> BTreeMap<String, String> {
    if value.is_empty() {
        return BTreeMap::new();
    }
    serde_json::from_str::<Option<BTreeMap<String, String>>>(value)
        .ok()
        .flatten()
        .unwrap_or_default()
}
