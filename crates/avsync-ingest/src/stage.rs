//! Stage definitions, dependency graph and command resolution
//!
//! Each entity type is synchronised by exactly one [`Stage`]. The static
//! [`StageDef`] table declares which stages must have populated the target
//! store before a stage can resolve its foreign keys. [`StageGraph`] validates
//! that table once and answers "which stages does this command run, in which
//! order".

use crate::error::PipelineError;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

/// One dependency-ordered unit of work, one per entity type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    AircraftCategories,
    AircraftTypes,
    Aircraft,
    Crew,
    DutyCategories,
    FlightLegs,
    AircraftEvents,
    CrewAssignments,
    PersonnelEvents,
}

impl Stage {
    pub const ALL: [Stage; 9] = [
        Stage::AircraftCategories,
        Stage::AircraftTypes,
        Stage::Aircraft,
        Stage::Crew,
        Stage::DutyCategories,
        Stage::FlightLegs,
        Stage::AircraftEvents,
        Stage::CrewAssignments,
        Stage::PersonnelEvents,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::AircraftCategories => "aircraft-categories",
            Stage::AircraftTypes => "aircraft-types",
            Stage::Aircraft => "aircraft",
            Stage::Crew => "crew",
            Stage::DutyCategories => "duty-categories",
            Stage::FlightLegs => "flight-legs",
            Stage::AircraftEvents => "aircraft-events",
            Stage::CrewAssignments => "crew-assignments",
            Stage::PersonnelEvents => "personnel-events",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == wanted)
            .ok_or_else(|| PipelineError::UnknownStage(s.to_string()))
    }
}

/// How a stage bounds its extraction window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPolicy {
    /// Reference data, always pulled in full
    Unbounded,
    /// Pulled from the last checkpoint onwards
    Incremental {
        /// Also pull scheduled records that lie in the future
        future_horizon: bool,
    },
}

/// Static definition of a stage
#[derive(Debug, Clone)]
pub struct StageDef {
    pub stage: Stage,
    /// Stages whose records this stage references
    pub prerequisites: Vec<Stage>,
    /// Raw fields whose normalised values form the natural key
    pub key_fields: Vec<&'static str>,
    /// Source endpoint name
    pub endpoint: &'static str,
    pub window: WindowPolicy,
    /// Canonical field exposed to dependent stages through the lookup cache
    pub lookup_field: Option<&'static str>,
}

impl StageDef {
    pub fn new(stage: Stage, endpoint: &'static str, window: WindowPolicy) -> Self {
        Self {
            stage,
            prerequisites: Vec::new(),
            key_fields: vec!["id"],
            endpoint,
            window,
            lookup_field: None,
        }
    }

    pub fn requires(mut self, prerequisites: &[Stage]) -> Self {
        self.prerequisites = prerequisites.to_vec();
        self
    }

    pub fn keyed_by(mut self, fields: &[&'static str]) -> Self {
        self.key_fields = fields.to_vec();
        self
    }

    pub fn exposes(mut self, field: &'static str) -> Self {
        self.lookup_field = Some(field);
        self
    }
}

/// The nine entity stages and their dependencies
pub fn standard_definitions() -> Vec<StageDef> {
    use WindowPolicy::{Incremental, Unbounded};

    vec![
        StageDef::new(Stage::AircraftCategories, "AircraftCategory", Unbounded),
        StageDef::new(Stage::AircraftTypes, "AircraftModel", Unbounded)
            .requires(&[Stage::AircraftCategories]),
        StageDef::new(Stage::Aircraft, "Aircraft", Unbounded)
            .requires(&[Stage::AircraftTypes, Stage::AircraftCategories]),
        StageDef::new(Stage::Crew, "personnel", Incremental { future_horizon: false }),
        StageDef::new(Stage::DutyCategories, "dutycategory", Unbounded)
            .keyed_by(&["code"])
            .exposes("is_available"),
        StageDef::new(Stage::FlightLegs, "flightleg", Incremental { future_horizon: true })
            .requires(&[Stage::Aircraft, Stage::Crew]),
        StageDef::new(Stage::AircraftEvents, "aircraftEvent", Incremental { future_horizon: true })
            .requires(&[Stage::Aircraft]),
        StageDef::new(Stage::CrewAssignments, "crewAssignment", Incremental { future_horizon: true })
            .requires(&[Stage::Aircraft, Stage::Crew]),
        StageDef::new(Stage::PersonnelEvents, "personnelEvent", Incremental { future_horizon: true })
            .requires(&[Stage::Crew, Stage::DutyCategories]),
    ]
}

/// What the caller asked to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Full,
    Setup,
    AircraftOnly,
    CrewOnly,
    FlightDataOnly,
    CrewAssignmentsOnly,
    PersonnelEventsOnly,
    Stage(Stage),
}

impl Command {
    /// Stages named by the command, `None` meaning every defined stage.
    pub fn members(&self) -> Option<Vec<Stage>> {
        let members = match self {
            Command::Full => return None,
            Command::Setup => vec![
                Stage::AircraftCategories,
                Stage::AircraftTypes,
                Stage::Aircraft,
                Stage::Crew,
            ],
            Command::AircraftOnly => vec![
                Stage::AircraftCategories,
                Stage::AircraftTypes,
                Stage::Aircraft,
            ],
            Command::CrewOnly => vec![Stage::Crew, Stage::DutyCategories],
            Command::FlightDataOnly => vec![Stage::FlightLegs, Stage::AircraftEvents],
            Command::CrewAssignmentsOnly => vec![Stage::CrewAssignments],
            Command::PersonnelEventsOnly => vec![Stage::PersonnelEvents],
            Command::Stage(stage) => vec![*stage],
        };
        Some(members)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Full => "full",
            Command::Setup => "setup",
            Command::AircraftOnly => "aircraft-only",
            Command::CrewOnly => "crew-only",
            Command::FlightDataOnly => "flight-data-only",
            Command::CrewAssignmentsOnly => "crew-assignments-only",
            Command::PersonnelEventsOnly => "personnel-events-only",
            Command::Stage(stage) => stage.as_str(),
        };
        f.write_str(name)
    }
}

impl FromStr for Command {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "full" => Ok(Command::Full),
            "setup" => Ok(Command::Setup),
            "aircraft-only" => Ok(Command::AircraftOnly),
            "crew-only" => Ok(Command::CrewOnly),
            "flight-data-only" => Ok(Command::FlightDataOnly),
            "crew-assignments-only" => Ok(Command::CrewAssignmentsOnly),
            "personnel-events-only" => Ok(Command::PersonnelEventsOnly),
            _ => s.parse::<Stage>().map(Command::Stage),
        }
    }
}

impl Serialize for Command {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Validated, acyclic stage dependency graph
#[derive(Debug, Clone)]
pub struct StageGraph {
    defs: HashMap<Stage, StageDef>,
    order: Vec<Stage>,
}

impl StageGraph {
    /// Validate definitions and compute the topological order.
    ///
    /// Ties between independent stages are broken by declaration order, so the
    /// order is stable across runs.
    pub fn new(defs: Vec<StageDef>) -> Result<Self, PipelineError> {
        let declared: Vec<Stage> = defs.iter().map(|d| d.stage).collect();
        let mut index: HashMap<Stage, usize> = HashMap::new();
        for (i, stage) in declared.iter().enumerate() {
            if index.insert(*stage, i).is_some() {
                return Err(PipelineError::InvalidStageGraph(format!(
                    "stage '{stage}' is defined more than once"
                )));
            }
        }

        let mut in_degree = vec![0usize; defs.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); defs.len()];
        for (i, def) in defs.iter().enumerate() {
            let unique: HashSet<Stage> = def.prerequisites.iter().copied().collect();
            for prerequisite in unique {
                let Some(&p) = index.get(&prerequisite) else {
                    return Err(PipelineError::InvalidStageGraph(format!(
                        "stage '{}' requires undefined stage '{prerequisite}'",
                        def.stage
                    )));
                };
                in_degree[i] += 1;
                dependents[p].push(i);
            }
        }

        // Kahn's algorithm over declaration indices
        let mut ready: BTreeSet<usize> = (0..defs.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(defs.len());
        while let Some(next) = ready.pop_first() {
            order.push(declared[next]);
            for &dependent in &dependents[next] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if order.len() != defs.len() {
            let stuck: Vec<&str> = declared
                .iter()
                .filter(|stage| !order.contains(stage))
                .map(Stage::as_str)
                .collect();
            return Err(PipelineError::InvalidStageGraph(format!(
                "dependency cycle between stages: {}",
                stuck.join(", ")
            )));
        }

        let defs = defs.into_iter().map(|def| (def.stage, def)).collect();
        Ok(Self { defs, order })
    }

    pub fn standard() -> Result<Self, PipelineError> {
        Self::new(standard_definitions())
    }

    pub fn definition(&self, stage: Stage) -> Option<&StageDef> {
        self.defs.get(&stage)
    }

    pub fn topological_order(&self) -> &[Stage] {
        &self.order
    }

    pub fn prerequisites(&self, stage: Stage) -> &[Stage] {
        self.defs
            .get(&stage)
            .map(|def| def.prerequisites.as_slice())
            .unwrap_or(&[])
    }

    /// Ordered stage list for a command. Prerequisites are not added.
    pub fn resolve(&self, command: Command) -> Result<Vec<Stage>, PipelineError> {
        let Some(members) = command.members() else {
            return Ok(self.order.clone());
        };

        if let Some(missing) = members.iter().find(|stage| !self.defs.contains_key(*stage)) {
            return Err(PipelineError::UnknownStage(missing.to_string()));
        }

        Ok(self
            .order
            .iter()
            .copied()
            .filter(|stage| members.contains(stage))
            .collect())
    }
}
