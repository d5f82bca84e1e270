//! Flight operations: legs, aircraft events and crew assignments

use super::fields::{Fields, Record};
use super::Normalised;
use crate::config::TransformConfig;
use crate::error::RecordError;
use crate::lookup::LookupCache;
use crate::stage::Stage;
use crate::types::TargetId;
use chrono::{DateTime, Duration, NaiveDate, Timelike, Utc};

const PIC: i64 = 1;
const SIC: i64 = 2;

fn position_id(position: &str) -> Option<i64> {
    match position.to_lowercase().as_str() {
        "pic" => Some(PIC),
        "sic" => Some(SIC),
        _ => None,
    }
}

/// Scheduled out/off/on/in times with taxi padding
#[derive(Debug, PartialEq, Eq)]
struct Oooi {
    out: DateTime<Utc>,
    off: DateTime<Utc>,
    on: DateTime<Utc>,
    inn: DateTime<Utc>,
}

impl Oooi {
    fn scheduled(departure: DateTime<Utc>, arrival: DateTime<Utc>, padding_minutes: i64) -> Self {
        let padding = Duration::minutes(padding_minutes);
        Self {
            out: departure,
            off: departure + padding,
            on: arrival - padding,
            inn: arrival,
        }
    }

    fn block_minutes(&self) -> i64 {
        (self.inn - self.out).num_minutes()
    }

    fn flight_minutes(&self) -> i64 {
        (self.on - self.off).num_minutes()
    }
}

#[derive(Default)]
struct Pilot {
    id: Option<TargetId>,
    name: Option<String>,
}

pub(super) fn flight_leg(
    fields: &Fields<'_>,
    lookups: &LookupCache,
    config: &TransformConfig,
) -> Normalised {
    let departure_icao = fields
        .upper("departureICAO")
        .ok_or_else(|| RecordError::validation("departureICAO", "missing required value"))?;
    let arrival_icao = fields
        .upper("arrivalICAO")
        .ok_or_else(|| RecordError::validation("arrivalICAO", "missing required value"))?;

    let departure = fields.required_timestamp("scheduledDepartureDateUTC")?;
    let arrival = fields.required_timestamp("scheduledArrivalDateUTC")?;
    if arrival < departure {
        return Err(RecordError::validation(
            "scheduledArrivalDateUTC",
            "arrives before it departs",
        ));
    }
    let oooi = Oooi::scheduled(departure, arrival, config.block_padding_minutes);

    let aircraft_id = fields.optional_reference("aircraftID", Stage::Aircraft, lookups)?;

    let mut pic = Pilot::default();
    let mut sic = Pilot::default();
    for member in fields.array("crew") {
        let member = Fields::new(member)?;
        let slot = match member.text("crewPosition").as_deref().and_then(position_id) {
            Some(PIC) => &mut pic,
            Some(_) => &mut sic,
            None => continue,
        };
        slot.id = member.optional_reference("crewID", Stage::Crew, lookups)?;
        let name = [member.text("firstName"), member.text("lastName")]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        slot.name = (!name.is_empty()).then_some(name);
    }

    let is_position = fields.flag("isEmpty")?.unwrap_or(false);
    let is_owner = fields.text("tripRegulatoryType").as_deref() == Some("Part 91");

    let record = Record::new()
        .set_opt("trip_id", fields.text("tripID"))
        .set_opt("trip_number", fields.text("tripNumber"))
        .set_opt("aircraft_id", aircraft_id)
        .set_opt("tail_number", fields.upper("tailNumber"))
        .set("from_airport", departure_icao)
        .set("to_airport", arrival_icao)
        .set_time("out_time", Some(oooi.out))
        .set_time("off_time", Some(oooi.off))
        .set_time("on_time", Some(oooi.on))
        .set_time("in_time", Some(oooi.inn))
        .set_time("actual_out_time", fields.timestamp("outOfBlocksUTC")?)
        .set_time("actual_off_time", fields.timestamp("actualDepartureDateUTC")?)
        .set_time("actual_on_time", fields.timestamp("actualArrivalDateUTC")?)
        .set_time("actual_in_time", fields.timestamp("inBlocksUTC")?)
        .set("block_minutes", oooi.block_minutes())
        .set("flight_minutes", oooi.flight_minutes())
        .set_opt("status", fields.text("status"))
        .set_opt("pic_id", pic.id)
        .set_opt("pic", pic.name)
        .set_opt("sic_id", sic.id)
        .set_opt("sic", sic.name)
        .set("passenger_count", fields.integer("passengerCount")?.unwrap_or(0))
        .set("is_position", is_position)
        .set("is_owner", is_owner);
    Ok(Some(record.into_map()))
}

pub(super) fn aircraft_event(
    fields: &Fields<'_>,
    lookups: &LookupCache,
    _: &TransformConfig,
) -> Normalised {
    let aircraft_id = fields.reference("aircraftID", Stage::Aircraft, lookups)?;
    let start = fields.required_timestamp("outOfServiceDateTimeUTC")?;
    let projected_end = fields.timestamp("projectedReturnToServiceDateTimeUTC")?;
    if projected_end.is_some_and(|end| end < start) {
        return Err(RecordError::validation(
            "projectedReturnToServiceDateTimeUTC",
            "returns to service before going out of service",
        ));
    }

    // maintenanceType 1 is scheduled maintenance, everything else is untyped
    let event_type = match fields.integer("maintenanceType")? {
        Some(1) => "mx",
        _ => "",
    };

    let record = Record::new()
        .set("aircraft_id", aircraft_id)
        .set_opt("tail_number", fields.upper("aircraft"))
        .set("event_type", event_type)
        .set_opt("description", fields.text("name"))
        .set_time("start_time", Some(start))
        .set_time("projected_end_time", projected_end)
        .set_time(
            "actual_end_time",
            fields.timestamp("actualReturnToServiceDateTimeUTC")?,
        )
        .set_opt("airport", fields.upper("airport"));
    Ok(Some(record.into_map()))
}

pub(super) fn crew_assignment(
    fields: &Fields<'_>,
    lookups: &LookupCache,
    config: &TransformConfig,
) -> Normalised {
    let aircraft_id = fields.reference("aircraftID", Stage::Aircraft, lookups)?;
    let crew_id = fields.reference("personnelID", Stage::Crew, lookups)?;

    let start = fields.required_timestamp("startDateTimeUTC")?;
    let end = fields.required_timestamp("endDateTimeUTC")?;
    if end < start {
        return Err(RecordError::validation("endDateTimeUTC", "ends before it starts"));
    }

    let position = fields.text("crewPosition");
    let position_id = position.as_deref().and_then(position_id);

    let record = Record::new()
        .set("aircraft_id", aircraft_id)
        .set("crew_id", crew_id)
        .set_opt("crew_name", fields.text("personnelName"))
        .set_opt("tail_number", fields.upper("tailNumber"))
        .set_opt("position", position.map(|p| p.to_uppercase()))
        .set_opt("position_id", position_id)
        .set("duty_date", duty_date(start, config.duty_cutoff_hour).to_string())
        .set_time("start_time", Some(start - Duration::minutes(config.pre_duty_minutes)))
        .set_time("end_time", Some(end + Duration::minutes(config.post_duty_minutes)))
        .set_time("scheduled_start_time", Some(start))
        .set_time("scheduled_end_time", Some(end))
        .set_time("actual_start_time", fields.timestamp("actualStartDateTimeUTC")?)
        .set_time("actual_end_time", fields.timestamp("actualEndDateTimeUTC")?);
    Ok(Some(record.into_map()))
}

/// Early-morning starts belong to the previous day's duty.
fn duty_date(start: DateTime<Utc>, cutoff_hour: u32) -> NaiveDate {
    let date = start.date_naive();
    if start.hour() >= cutoff_hour {
        date
    } else {
        date.pred_opt().unwrap_or(date)
    }
}
