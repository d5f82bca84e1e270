//! Personnel, duty categories and personnel events

use super::fields::{Fields, Record};
use super::Normalised;
use crate::config::TransformConfig;
use crate::error::RecordError;
use crate::lookup::LookupCache;
use crate::stage::Stage;
use chrono::{Datelike, NaiveDate, Utc};
use serde_json::Value;

pub(super) fn crew_member(
    fields: &Fields<'_>,
    _: &LookupCache,
    config: &TransformConfig,
) -> Normalised {
    let first_name = fields.text("firstName");
    let last_name = fields.text("lastName");

    let joined = [first_name.as_deref(), last_name.as_deref()]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ");
    let name = if joined.is_empty() {
        fields
            .text("fullName")
            .ok_or_else(|| RecordError::validation("fullName", "crew member has no name"))?
    } else {
        joined
    };

    let code = fields
        .text("employeeId")
        .or_else(|| fields.text("code"))
        .or_else(|| crew_code(first_name.as_deref(), last_name.as_deref()));

    let date_of_birth = fields.date("dateOfBirth")?;
    let is_senior = date_of_birth
        .map(|dob| age_on(dob, Utc::now().date_naive()) >= i64::from(config.senior_age_threshold))
        .unwrap_or(false);

    let is_active = match fields.flag("active")? {
        Some(active) => active,
        None => fields.flag("isActive")?.unwrap_or(true),
    };

    let record = Record::new()
        .set("name", name)
        .set_opt("first_name", first_name)
        .set_opt("last_name", last_name)
        .set_opt("code", code)
        .set_opt("home_base", fields.upper("homebaseAirport"))
        .set("is_active", is_active)
        .set("is_senior", is_senior);
    Ok(Some(record.into_map()))
}

/// First three letters of the last name plus the first initial, upper-cased.
fn crew_code(first_name: Option<&str>, last_name: Option<&str>) -> Option<String> {
    let last: String = last_name?.chars().filter(|c| c.is_alphabetic()).take(3).collect();
    let initial = first_name?.chars().find(|c| c.is_alphabetic())?;
    if last.is_empty() {
        return None;
    }
    Some(format!("{last}{initial}").to_uppercase())
}

fn age_on(birth: NaiveDate, today: NaiveDate) -> i64 {
    let mut age = i64::from(today.year() - birth.year());
    if (today.month(), today.day()) < (birth.month(), birth.day()) {
        age -= 1;
    }
    age
}

/// Duty categories are available unless the source or the configured
/// override says otherwise.
pub(super) fn duty_category(
    fields: &Fields<'_>,
    _: &LookupCache,
    config: &TransformConfig,
) -> Normalised {
    let code = fields.required_text("code")?;
    let description = fields
        .text("description")
        .or_else(|| fields.text("name"))
        .unwrap_or_else(|| code.clone());

    let flagged = match fields.flag("isAvailable")? {
        Some(available) => available,
        None => fields.flag("available")?.unwrap_or(true),
    };
    let is_available = flagged && !config.is_listed_unavailable(&code);

    let record = Record::new()
        .set("code", code)
        .set("description", description)
        .set("is_available", is_available);
    Ok(Some(record.into_map()))
}

pub(super) fn personnel_event(
    fields: &Fields<'_>,
    lookups: &LookupCache,
    config: &TransformConfig,
) -> Normalised {
    let event_type = fields.text("eventType");
    let category = fields.text("dutyEventCategory");

    // Only unavailability is synchronised
    let unavailable = event_type.as_deref() == Some("hardDayOff")
        || category.as_deref().is_some_and(|code| {
            config.is_listed_unavailable(code)
                || lookups
                    .field(Stage::DutyCategories, code)
                    .and_then(Value::as_bool)
                    == Some(false)
        });
    if !unavailable {
        return Ok(None);
    }

    let crew_id = fields.reference("personnelID", Stage::Crew, lookups)?;
    let start = fields.required_timestamp("startDateTimeUTC")?;
    let end = fields.required_timestamp("endDateTimeUTC")?;
    if end < start {
        return Err(RecordError::validation("endDateTimeUTC", "ends before it starts"));
    }

    let record = Record::new()
        .set("crew_id", crew_id)
        .set_opt("crew_name", fields.text("personnelName"))
        .set_opt("event_type", event_type)
        .set_opt("category", category)
        .set_time("start_time", Some(start))
        .set_time("end_time", Some(end))
        .set("is_unavailable", true)
        .set_time("source_updated_at", fields.timestamp("lastUpdatedDate")?);
    Ok(Some(record.into_map()))
}
