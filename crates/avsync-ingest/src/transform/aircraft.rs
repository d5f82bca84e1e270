//! Fleet reference data: categories, types and aircraft

use super::fields::{Fields, Record};
use super::Normalised;
use crate::config::TransformConfig;
use crate::error::RecordError;
use crate::lookup::LookupCache;
use crate::stage::Stage;

pub(super) fn category(fields: &Fields<'_>, _: &LookupCache, _: &TransformConfig) -> Normalised {
    let name = fields.required_text("name")?;

    // The source has no separate category code
    let record = Record::new().set("code", name.clone()).set("name", name);
    Ok(Some(record.into_map()))
}

pub(super) fn aircraft_type(
    fields: &Fields<'_>,
    lookups: &LookupCache,
    _: &TransformConfig,
) -> Normalised {
    let name = fields.required_text("name")?;
    let manufacturer = fields.text("manufacturer");
    let description = match &manufacturer {
        Some(manufacturer) => format!("{manufacturer} {name}"),
        None => name.clone(),
    };
    let category_id =
        fields.optional_reference("aircraftCategoryID", Stage::AircraftCategories, lookups)?;

    let record = Record::new()
        .set("name", name)
        .set_opt("code", fields.text("code"))
        .set_opt("manufacturer", manufacturer)
        .set("description", description)
        .set_opt("aircraft_category_id", category_id);
    Ok(Some(record.into_map()))
}

pub(super) fn aircraft(
    fields: &Fields<'_>,
    lookups: &LookupCache,
    _: &TransformConfig,
) -> Normalised {
    // Only active aircraft under management are synchronised
    let active = fields.flag("active")?.unwrap_or(false);
    let managed = fields.flag("managed")?.unwrap_or(false);
    if !(active && managed) {
        return Ok(None);
    }

    let tail_number = fields
        .upper("tailNumber")
        .ok_or_else(|| RecordError::validation("tailNumber", "missing required value"))?;

    let max_pax = fields.integer("capacity")?;
    if let Some(pax) = max_pax.filter(|pax| *pax < 0) {
        return Err(RecordError::validation("capacity", format!("negative capacity {pax}")));
    }

    let type_id = fields.optional_reference("aircraftModelID", Stage::AircraftTypes, lookups)?;
    let category_id =
        fields.optional_reference("aircraftCategoryID", Stage::AircraftCategories, lookups)?;

    let record = Record::new()
        .set("tail_number", tail_number)
        .set_opt(
            "serial_number",
            fields.text("serialNumber").or_else(|| fields.text("displayTypeCode")),
        )
        .set_opt("display_type", fields.text("displayTypeCode"))
        .set_opt("aircraft_type_id", type_id)
        .set_opt("aircraft_category_id", category_id)
        .set_opt("max_pax", max_pax)
        .set_opt("home_base", fields.upper("homebase"))
        .set_opt("owner_name", fields.text("vendorName"))
        .set("is_active", true);
    Ok(Some(record.into_map()))
}
