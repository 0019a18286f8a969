//! Turn raw feed JSON into [`ListingSnapshot`]s.
//!
//! Feeds disagree on field names, so each field checks a list of well-known
//! keys in order. Numbers may arrive as JSON numbers or as strings like
//! `"$1,250"`.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use rentflow_core::ListingSnapshot;

use crate::error::NormalizeError;

const ID_KEYS: &[&str] = &["id", "listingId", "listing_id", "mlsId", "mls_id"];
const STATUS_KEYS: &[&str] = &["status", "listingStatus", "listing_status", "state"];
const PRICE_KEYS: &[&str] = &["price", "listPrice", "list_price"];
const FEES_KEYS: &[&str] = &["fees", "hoa", "hoaFee", "hoa_fee", "associationFee"];
const TAX_KEYS: &[&str] = &["tax", "taxes", "annualTax", "annual_tax"];
const ADDRESS_KEYS: &[&str] = &["address", "streetAddress", "street_address"];
const STREET_KEYS: &[&str] = &["street", "line1", "streetAddress"];
const ZIP_KEYS: &[&str] = &["zip", "zipCode", "zip_code", "postalCode", "postal_code"];
const BEDS_KEYS: &[&str] = &["beds", "bedrooms"];
const BATHS_KEYS: &[&str] = &["baths", "bathrooms"];
const SQFT_KEYS: &[&str] = &["sqft", "livingArea", "living_area", "squareFeet"];
const MEDIA_KEYS: &[&str] = &["media", "photos", "images"];
const UPDATED_KEYS: &[&str] = &[
    "updatedAt", "updated_at",
    "lastModified", "last_modified",
    "modifiedAt", "modified_at",
    "timestamp",
];

const DEFAULT_STATUS: &str = "unknown";

fn first_present<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .find_map(|k| obj.get(*k))
        .filter(|v| !v.is_null())
}

fn first_str<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| obj.get(*k).and_then(|v| v.as_str()))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let cleaned: String = s.chars().filter(|c| !matches!(c, '$' | ',' | ' ')).collect();
            cleaned.parse().ok()
        }
        _ => None,
    }
}

fn number(
    obj: &Map<String, Value>,
    keys: &[&str],
    field: &'static str,
) -> Result<Option<f64>, NormalizeError> {
    match first_present(obj, keys) {
        None => Ok(None),
        Some(v) => match as_number(v) {
            Some(n) if n.is_finite() && n >= 0.0 => Ok(Some(n)),
            _ => Err(NormalizeError::Invalid {
                field,
                message: format!("expected a non-negative number, got {v}"),
            }),
        },
    }
}

fn id_of(obj: &Map<String, Value>) -> Option<String> {
    ID_KEYS.iter().find_map(|k| match obj.get(*k) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Address may be a plain string or an object carrying its own zip.
fn address_of(obj: &Map<String, Value>) -> (Option<String>, Option<String>) {
    match first_present(obj, ADDRESS_KEYS) {
        Some(Value::String(s)) if !s.trim().is_empty() => (Some(s.trim().to_string()), None),
        Some(Value::Object(inner)) => (
            first_str(inner, STREET_KEYS).map(str::to_string),
            first_str(inner, ZIP_KEYS).map(str::to_string),
        ),
        _ => (None, None),
    }
}

fn media_of(obj: &Map<String, Value>) -> Vec<String> {
    let Some(Value::Array(items)) = first_present(obj, MEDIA_KEYS) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(url) => Some(url.clone()),
            Value::Object(m) => m.get("url").and_then(|u| u.as_str()).map(str::to_string),
            _ => None,
        })
        .collect()
}

/// Normalize one feed item. Requires an id, an address and an update timestamp.
pub fn normalize_listing(raw: &Value) -> Result<ListingSnapshot, NormalizeError> {
    let obj = raw.as_object().ok_or(NormalizeError::NotAnObject)?;

    let id = id_of(obj).ok_or(NormalizeError::MissingField("id"))?;

    let updated_raw = first_str(obj, UPDATED_KEYS).ok_or(NormalizeError::MissingField("updatedAt"))?;
    let updated_at = updated_raw
        .parse::<DateTime<Utc>>()
        .map_err(|e| NormalizeError::Invalid {
            field: "updatedAt",
            message: e.to_string(),
        })?;

    let (address, nested_zip) = address_of(obj);
    let address = address.ok_or(NormalizeError::MissingField("address"))?;
    let zip = first_str(obj, ZIP_KEYS).map(str::to_string).or(nested_zip);

    let status = first_str(obj, STATUS_KEYS)
        .map(|s| s.to_lowercase().replace(' ', "_"))
        .unwrap_or_else(|| DEFAULT_STATUS.to_string());

    Ok(ListingSnapshot {
        id,
        status,
        price: number(obj, PRICE_KEYS, "price")?,
        fees: number(obj, FEES_KEYS, "fees")?,
        tax: number(obj, TAX_KEYS, "tax")?,
        address,
        zip,
        beds: number(obj, BEDS_KEYS, "beds")?.map(|v| v as f32),
        baths: number(obj, BATHS_KEYS, "baths")?.map(|v| v as f32),
        sqft: number(obj, SQFT_KEYS, "sqft")?.map(|v| v.round() as u32),
        media: media_of(obj),
        updated_at,
    })
}

/// Best-effort update timestamp of a raw item, used for feed ordering.
pub fn updated_at_of(raw: &Value) -> Option<DateTime<Utc>> {
    raw.as_object()
        .and_then(|obj| first_str(obj, UPDATED_KEYS))
        .and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn canonical_shape() {
        let raw = json!({
            "id": "L1",
            "status": "Active",
            "price": 725000,
            "fees": 410.5,
            "tax": 8100,
            "address": "12 Elm St",
            "zip": "94110",
            "beds": 2,
            "baths": 1.5,
            "sqft": 980,
            "media": ["a.jpg", "b.jpg"],
            "updatedAt": "2024-03-01T08:00:00Z"
        });
        let listing = normalize_listing(&raw).unwrap();
        assert_eq!(listing.id, "L1");
        assert_eq!(listing.status, "active");
        assert_eq!(listing.price, Some(725_000.0));
        assert_eq!(listing.baths, Some(1.5));
        assert_eq!(listing.sqft, Some(980));
        assert_eq!(listing.media.len(), 2);
        assert_eq!(
            listing.updated_at,
            Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
        );
    }

    #[test]
    fn alternate_keys_and_formatted_numbers() {
        let raw = json!({
            "listingId": 4417,
            "listingStatus": "Under Contract",
            "listPrice": "$1,250,000",
            "hoaFee": "350",
            "address": {"street": "9 Oak Ave", "postalCode": "10001"},
            "photos": [{"url": "x.jpg"}, {"caption": "no url"}],
            "last_modified": "2024-03-02T10:30:00+02:00"
        });
        let listing = normalize_listing(&raw).unwrap();
        assert_eq!(listing.id, "4417");
        assert_eq!(listing.status, "under_contract");
        assert_eq!(listing.price, Some(1_250_000.0));
        assert_eq!(listing.fees, Some(350.0));
        assert_eq!(listing.address, "9 Oak Ave");
        assert_eq!(listing.zip.as_deref(), Some("10001"));
        assert_eq!(listing.media, vec!["x.jpg".to_string()]);
        assert_eq!(
            listing.updated_at,
            Utc.with_ymd_and_hms(2024, 3, 2, 8, 30, 0).unwrap()
        );
    }

    #[test]
    fn missing_required_fields() {
        let no_id = json!({"address": "x", "updatedAt": "2024-03-01T00:00:00Z"});
        assert_eq!(normalize_listing(&no_id), Err(NormalizeError::MissingField("id")));

        let no_time = json!({"id": "L1", "address": "x"});
        assert_eq!(
            normalize_listing(&no_time),
            Err(NormalizeError::MissingField("updatedAt"))
        );

        assert_eq!(normalize_listing(&json!([1, 2])), Err(NormalizeError::NotAnObject));
    }

    #[test]
    fn garbage_number_is_rejected() {
        let raw = json!({
            "id": "L1",
            "address": "x",
            "price": "call for price",
            "updatedAt": "2024-03-01T00:00:00Z"
        });
        assert!(matches!(
            normalize_listing(&raw),
            Err(NormalizeError::Invalid { field: "price", .. })
        ));
    }
}
