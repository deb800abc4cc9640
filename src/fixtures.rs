//! Fixture opinion sets for test-mode runs.
//!
//! `themes run --test-mode` clusters a fixed set of opinions without
//! touching the database. Without `--fixture` the built-in set below is
//! used; otherwise a TOML file:
//!
//! ```toml
//! [[opinions]]
//! id = 1
//! text = "Protected bike lanes on Main Street"
//! agenda_id = 3          # optional
//! created_at = 1700000000
//!
//! # Optional: clusters that already exist. Centroid length must match
//! # the provider's dims.
//! [[clusters]]
//! id = 10
//! title = "Cycling"
//! centroid = [0.1, 0.2]
//! member_count = 4
//! created_at = 1690000000
//! ```

use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use opinion_themes_core::models::{Cluster, Opinion};

#[derive(Debug, Deserialize)]
struct FixtureFile {
    #[serde(default)]
    opinions: Vec<FixtureOpinion>,
    #[serde(default)]
    clusters: Vec<FixtureCluster>,
}

#[derive(Debug, Deserialize)]
struct FixtureOpinion {
    id: i64,
    text: String,
    #[serde(default)]
    agenda_id: Option<i64>,
    created_at: i64,
}

#[derive(Debug, Deserialize)]
struct FixtureCluster {
    id: i64,
    title: String,
    centroid: Vec<f32>,
    #[serde(default)]
    member_count: i64,
    created_at: i64,
}

/// A fixture: opinions to cluster and any pre-existing clusters.
#[derive(Debug, Clone, Default)]
pub struct Fixture {
    pub opinions: Vec<Opinion>,
    pub clusters: Vec<Cluster>,
}

/// Read and validate a fixture file.
pub fn load_fixture(path: &Path) -> Result<Fixture> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read fixture file: {}", path.display()))?;
    parse_fixture(&content).with_context(|| format!("Invalid fixture: {}", path.display()))
}

pub fn parse_fixture(content: &str) -> Result<Fixture> {
    let file: FixtureFile = toml::from_str(content)?;

    let mut seen = HashSet::new();
    for o in &file.opinions {
        if !seen.insert(o.id) {
            bail!("duplicate opinion id {}", o.id);
        }
        if o.text.trim().is_empty() {
            bail!("opinion {} has empty text", o.id);
        }
    }
    let mut seen = HashSet::new();
    for c in &file.clusters {
        if !seen.insert(c.id) {
            bail!("duplicate cluster id {}", c.id);
        }
    }

    Ok(Fixture {
        opinions: file
            .opinions
            .into_iter()
            .map(|o| Opinion {
                id: o.id,
                text: o.text,
                agenda_id: o.agenda_id,
                cluster_id: None,
                created_at: o.created_at,
            })
            .collect(),
        clusters: file
            .clusters
            .into_iter()
            .map(|c| Cluster {
                id: c.id,
                title: c.title,
                centroid: c.centroid,
                member_count: c.member_count,
                created_at: c.created_at,
            })
            .collect(),
    })
}

/// Built-in sample of portal feedback on three agendas.
pub fn builtin_fixture() -> Fixture {
    const BASE: i64 = 1_700_000_000;
    let texts: [(Option<i64>, &str); 12] = [
        (Some(1), "Protected bike lanes on Main Street"),
        (Some(2), "Extend library opening hours on weekends"),
        (Some(1), "Protected bike lanes on Main Street please"),
        (Some(3), "Plant shade trees in Riverside Park"),
        (Some(2), "Library opening hours on weekends are too short"),
        (Some(1), "More protected bike lanes near Main Street"),
        (Some(3), "Riverside Park needs more shade trees"),
        (Some(2), "Extend library opening hours"),
        (Some(3), "Shade trees for Riverside Park playground"),
        (Some(1), "Fix the potholes on Harbor Road"),
        (None, "Bus shelters at every stop on Harbor Road"),
        (Some(3), "Plant shade trees in Riverside Park"),
    ];

    let opinions = texts
        .iter()
        .enumerate()
        .map(|(i, (agenda_id, text))| Opinion {
            id: i as i64 + 1,
            text: text.to_string(),
            agenda_id: *agenda_id,
            cluster_id: None,
            created_at: BASE + (i as i64) * 60,
        })
        .collect();

    Fixture {
        opinions,
        clusters: Vec::new(),
    }
}
