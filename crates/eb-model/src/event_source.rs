//! [`EventSource`] implementations: in-memory, JSON-lines files and their concatenation.

use crate::kinematics::{pair_event, FourMomentum};
use eb_core::{Error, EventSource, KinematicEvent, Result};
use serde::Deserialize;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Events held in memory.
#[derive(Debug, Clone)]
pub struct MemoryEventSource {
    id: String,
    events: Vec<KinematicEvent>,
}

impl MemoryEventSource {
    /// Wrap an already reduced event list.
    pub fn new(id: impl Into<String>, events: Vec<KinematicEvent>) -> Self {
        Self { id: id.into(), events }
    }

    /// Build from two-particle four-momentum pairs.
    pub fn from_pairs(
        id: impl Into<String>,
        pairs: impl IntoIterator<Item = (FourMomentum, FourMomentum)>,
    ) -> Result<Self> {
        let events = pairs.into_iter().map(|(p1, p2)| pair_event(p1, p2)).collect::<Result<_>>()?;
        Ok(Self::new(id, events))
    }

    /// Number of stored events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// `true` when no events are stored.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl EventSource for MemoryEventSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn events(
        &self,
        max: Option<usize>,
    ) -> Result<Box<dyn Iterator<Item = Result<KinematicEvent>> + '_>> {
        let n = max.unwrap_or(self.events.len());
        Ok(Box::new(self.events.iter().take(n).copied().map(Ok)))
    }
}

/// One line of a JSON-lines event file.
///
/// Either a raw two-particle record (`{"p1": [E, px, py, pz], "p2": [...], "score": ...}`)
/// or an already reduced event (`{"mass": ..., "rapidity": ..., "score": ...}`).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum EventRecord {
    Pair {
        p1: FourMomentum,
        p2: FourMomentum,
        #[serde(default)]
        score: Option<f64>,
    },
    Reduced(KinematicEvent),
}

impl EventRecord {
    fn into_event(self) -> Result<KinematicEvent> {
        match self {
            EventRecord::Pair { p1, p2, score } => {
                let ev = pair_event(p1, p2)?;
                Ok(match score {
                    Some(s) => ev.with_score(s),
                    None => ev,
                })
            }
            EventRecord::Reduced(ev) => Ok(ev),
        }
    }
}

/// JSON-lines event file, read lazily; every iteration reopens the file.
#[derive(Debug, Clone)]
pub struct JsonlEventSource {
    path: PathBuf,
    id: String,
}

impl JsonlEventSource {
    /// Source reading from `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let id = path.display().to_string();
        Self { path, id }
    }

    /// Report `id` (e.g. a Monte-Carlo run name) instead of the path.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

impl EventSource for JsonlEventSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn events(
        &self,
        max: Option<usize>,
    ) -> Result<Box<dyn Iterator<Item = Result<KinematicEvent>> + '_>> {
        let file = std::fs::File::open(&self.path)?;
        let lines = BufReader::new(file).lines().enumerate();
        let it = lines
            .filter(|(_, line)| line.as_ref().map(|l| !l.trim().is_empty()).unwrap_or(true))
            .map(move |(lineno, line)| {
                let line = line?;
                let record: EventRecord = serde_json::from_str(&line).map_err(|e| {
                    Error::Validation(format!("{}:{}: {e}", self.path.display(), lineno + 1))
                })?;
                record.into_event()
            })
            .take(max.unwrap_or(usize::MAX));
        Ok(Box::new(it))
    }
}

/// Several sources read back to back, in order.
pub struct ChainedEventSource {
    sources: Vec<Box<dyn EventSource>>,
    id: String,
}

impl ChainedEventSource {
    /// Chain `sources`; the id joins theirs with `+`.
    pub fn new(sources: Vec<Box<dyn EventSource>>) -> Result<Self> {
        if sources.is_empty() {
            return Err(Error::Validation("event chain requires >= 1 source".into()));
        }
        let id = sources.iter().map(|s| s.id()).collect::<Vec<_>>().join("+");
        Ok(Self { sources, id })
    }

    /// Ids of the chained sources, in reading order.
    pub fn source_ids(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.id().to_string()).collect()
    }
}

impl EventSource for ChainedEventSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn events(
        &self,
        max: Option<usize>,
    ) -> Result<Box<dyn Iterator<Item = Result<KinematicEvent>> + '_>> {
        let mut parts = Vec::with_capacity(self.sources.len());
        for src in &self.sources {
            parts.push(src.events(None)?);
        }
        Ok(Box::new(parts.into_iter().flatten().take(max.unwrap_or(usize::MAX))))
    }
}
