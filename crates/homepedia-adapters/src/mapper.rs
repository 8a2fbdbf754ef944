//! Raw listing -> canonical [`Property`].

use chrono::{DateTime, Utc};
use homepedia_core::normalize::{
    derive_price_per_m2, normalize_amount, normalize_count, parse_localized_decimal, round_count,
    NormalizationWarning,
};
use homepedia_core::{Property, PropertyType, Source};
use serde_json::{json, Value as JsonValue};
use tracing::warn;

use crate::{DvfRow, MapRejection, RawListing, RecordContext, SelogerCard};

const SELOGER_TYPE_KEYWORDS: [&str; 6] = ["maison", "appartement", "terrain", "studio", "villa", "loft"];

pub fn map_listing(
    listing: RawListing,
    ctx: &RecordContext,
    seen_at: DateTime<Utc>,
) -> Result<Property, MapRejection> {
    match listing {
        RawListing::Dvf(row) => map_dvf(&row, seen_at),
        RawListing::Bienici(ad) => map_bienici(ad, ctx, seen_at),
        RawListing::Seloger(card) => map_seloger(&card, ctx, seen_at),
    }
}

/// Logs the warning and keeps going with a null field.
fn lenient<T>(
    result: Result<Option<T>, NormalizationWarning>,
    listing_url: &str,
    field: &'static str,
) -> Option<T> {
    result.unwrap_or_else(|warning| {
        warn!(%listing_url, field, %warning, "field normalized to null");
        None
    })
}

pub fn map_dvf(row: &DvfRow, seen_at: DateTime<Utc>) -> Result<Property, MapRejection> {
    if row.id_mutation.trim().is_empty() {
        return Err(MapRejection::MissingField("id_mutation"));
    }
    let listing_url = format!(
        "dvf_{}_{}",
        row.id_mutation.trim(),
        row.numero_disposition.trim()
    );

    let property_type = match row.type_local.trim() {
        "Maison" => PropertyType::House,
        "Appartement" => PropertyType::Flat,
        "" => return Err(MapRejection::MissingField("type_local")),
        other => PropertyType::Other(other.to_lowercase()),
    };

    let price = parse_localized_decimal(&row.valeur_fonciere)
        .map_err(|w| MapRejection::Malformed {
            field: "valeur_fonciere",
            reason: w.to_string(),
        })?
        .unwrap_or(0.0);
    if price <= 0.0 {
        return Err(MapRejection::NonPositive("valeur_fonciere"));
    }

    let surface_m2 = row.usable_surface().map_err(|w| MapRejection::Malformed {
        field: "surface",
        reason: w.to_string(),
    })?;
    if surface_m2 <= 0.0 {
        return Err(MapRejection::NonPositive("surface"));
    }

    let rooms = lenient(
        parse_localized_decimal(&row.nombre_pieces_principales)
            .and_then(|v| v.map(round_count).transpose()),
        &listing_url,
        "nombre_pieces_principales",
    );

    let mut property = Property::observed(listing_url, Source::Dvf, seen_at);
    property.department = row.code_departement.trim().to_string();
    property.city = row.nom_commune.trim().to_string();
    property.postal_code = row.code_postal.trim().to_string();
    property.address = row.address();
    property.price = price;
    property.surface_m2 = surface_m2;
    property.price_per_m2 = derive_price_per_m2(price, surface_m2);
    property.rooms = rooms;
    property.property_type = property_type;
    property.description = format!(
        "Mutation du {} - {}",
        row.date_mutation.trim(),
        row.nature_mutation.trim()
    );
    Ok(property)
}

fn bienici_type(raw: &str) -> Result<PropertyType, MapRejection> {
    Ok(match raw {
        "house" => PropertyType::House,
        "flat" => PropertyType::Flat,
        "loft" => PropertyType::Loft,
        "castle" => PropertyType::Castle,
        "townhouse" => PropertyType::Townhouse,
        "programme" => return Err(MapRejection::PreConstruction),
        other => PropertyType::Other(other.to_string()),
    })
}

fn json_text(value: &JsonValue, path: &[&str]) -> String {
    let mut cur = value;
    for key in path {
        match cur.get(*key) {
            Some(next) => cur = next,
            None => return String::new(),
        }
    }
    match cur {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

pub fn map_bienici(
    ad: JsonValue,
    ctx: &RecordContext,
    seen_at: DateTime<Utc>,
) -> Result<Property, MapRejection> {
    let listing_url = json_text(&ad, &["id"]);
    if listing_url.is_empty() {
        return Err(MapRejection::MissingField("id"));
    }

    let raw_type = json_text(&ad, &["propertyType"]);
    if raw_type.is_empty() {
        return Err(MapRejection::MissingField("propertyType"));
    }
    let property_type = bienici_type(&raw_type).inspect_err(|_| {
        warn!(%listing_url, "skipping pre-construction programme");
    })?;

    let null = JsonValue::Null;
    let field = |key: &str| ad.get(key).unwrap_or(&null);

    let price = lenient(normalize_amount(field("price")), &listing_url, "price").unwrap_or(0.0);
    let surface_m2 =
        lenient(normalize_amount(field("surfaceArea")), &listing_url, "surfaceArea").unwrap_or(0.0);
    let price_per_m2 = lenient(
        normalize_amount(field("pricePerSquareMeter")),
        &listing_url,
        "pricePerSquareMeter",
    )
    .unwrap_or_else(|| derive_price_per_m2(price, surface_m2));
    let rooms = lenient(normalize_count(field("roomsQuantity")), &listing_url, "roomsQuantity");
    let bedrooms = lenient(
        normalize_count(field("bedroomsQuantity")),
        &listing_url,
        "bedroomsQuantity",
    );

    let mut property = Property::observed(listing_url, Source::Bienici, seen_at);
    property.department = ctx.department.clone().unwrap_or_default();
    property.city = json_text(&ad, &["city"]);
    property.postal_code = json_text(&ad, &["postalCode"]);
    property.address = json_text(&ad, &["district", "name"]);
    property.description = json_text(&ad, &["description"]);
    property.price = price;
    property.surface_m2 = surface_m2;
    property.price_per_m2 = price_per_m2;
    property.rooms = rooms;
    property.bedrooms = bedrooms;
    property.property_type = property_type;
    property.features = ad;
    Ok(property)
}

/// Splits `"Montpellier (34000)"` into city and postal code.
pub fn split_city_postal(address: &str) -> (String, String) {
    match address.split_once('(') {
        Some((city, rest)) => {
            let postal = rest.split(')').next().unwrap_or_default();
            (city.trim().to_string(), postal.trim().to_string())
        }
        None => (address.trim().to_string(), String::new()),
    }
}

/// Leading number of a key fact such as `"118,5 m²"` or `"3 chambres"`.
fn fact_number(fact: &str) -> Result<Option<f64>, NormalizationWarning> {
    let numeric: String = fact
        .chars()
        .take_while(|c| c.is_ascii_digit() || matches!(c, ',' | '.') || c.is_whitespace())
        .collect();
    parse_localized_decimal(&numeric)
}

pub fn map_seloger(
    card: &SelogerCard,
    ctx: &RecordContext,
    seen_at: DateTime<Utc>,
) -> Result<Property, MapRejection> {
    let listing_url = card
        .link
        .clone()
        .ok_or(MapRejection::MissingField("link"))?;

    let price = card
        .price_text
        .as_deref()
        .and_then(|text| lenient(parse_localized_decimal(text), &listing_url, "price"))
        .unwrap_or(0.0);

    let find_fact = |needle: &str, exclude: Option<&str>| {
        card.key_facts.iter().find(|fact| {
            let fact = fact.to_lowercase();
            fact.contains(needle) && exclude.map_or(true, |ex| !fact.contains(ex))
        })
    };

    let rooms = find_fact("pièce", None).and_then(|fact| {
        lenient(
            fact_number(fact).and_then(|v| v.map(round_count).transpose()),
            &listing_url,
            "rooms",
        )
    });
    let bedrooms = find_fact("chambre", None).and_then(|fact| {
        lenient(
            fact_number(fact).and_then(|v| v.map(round_count).transpose()),
            &listing_url,
            "bedrooms",
        )
    });
    let surface_m2 = find_fact("m²", Some("terrain"))
        .and_then(|fact| lenient(fact_number(fact), &listing_url, "surface"))
        .unwrap_or(0.0);

    let type_text = card.type_text.as_deref().unwrap_or_default().to_lowercase();
    let property_type = SELOGER_TYPE_KEYWORDS
        .iter()
        .find(|keyword| type_text.contains(*keyword))
        .map(|keyword| PropertyType::from_label(keyword))
        .unwrap_or_else(|| PropertyType::Other("autre".to_string()));

    let address = card.address.clone().unwrap_or_default();
    let (city, postal_code) = split_city_postal(&address);

    let mut property = Property::observed(listing_url, Source::Seloger, seen_at);
    property.department = ctx.department.clone().unwrap_or_default();
    property.city = city;
    property.postal_code = postal_code;
    property.address = address;
    property.description = card.description.clone().unwrap_or_default();
    property.price = price;
    property.surface_m2 = surface_m2;
    property.price_per_m2 = derive_price_per_m2(price, surface_m2);
    property.rooms = rooms;
    property.bedrooms = bedrooms;
    property.property_type = property_type;
    property.features = json!({ "key_facts": card.key_facts });
    Ok(property)
}
