// ---------------------------------------------------------------------------
// User History: engine-owned derived fields over external profiles
// ---------------------------------------------------------------------------
//
// Static preferences arrive from the profile system via `upsert_profile`.
// Everything else here is derived from activity events: the completed set,
// the latest interaction and per-skill proficiency. Proficiency is a pure
// function of the skill's counters and is recomputed, for the touched skills
// only, on every event.
//
// Histories use `im` collections so a reader's snapshot is an O(1) clone
// taken under the user's lock and released immediately.
// ---------------------------------------------------------------------------

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::content::LearningMode;
use crate::error::EngineError;

const COMPLETION_WEIGHT: f64 = 1.0;
const APPLICATION_WEIGHT: f64 = 2.0;
const HOUR_WEIGHT: f64 = 0.5;
const PROFICIENCY_SCALE: f64 = 8.0;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
	pub user_id: String,
	pub preferred_tags: Vec<String>,
	pub preferred_modes: Vec<LearningMode>,
	pub updated_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityKind {
	Progress,
	Completed,
	Applied,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
	pub user_id: String,
	pub content_id: String,
	pub kind: ActivityKind,
	#[serde(default)]
	pub minutes: f64,
	pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillStats {
	pub completions: u32,
	pub applications: u32,
	pub minutes: f64,
	pub proficiency: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interaction {
	pub content_id: String,
	pub kind: ActivityKind,
	pub at: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserHistory {
	pub user_id: String,
	pub completed: im::HashSet<String>,
	/// Completion order with timestamps, for the interest centroid.
	pub completions: im::Vector<(String, u64)>,
	pub latest_interaction: Option<Interaction>,
	pub skills: im::OrdMap<String, SkillStats>,
	pub events: u64,
	pub updated_at: u64,
}

impl UserHistory {
	fn new(user_id: &str) -> Self {
		Self {
			user_id: user_id.to_string(),
			..Default::default()
		}
	}

	pub fn has_history(&self) -> bool {
		self.latest_interaction.is_some() || !self.completed.is_empty()
	}
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillUpdate {
	pub skill: String,
	pub proficiency: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventOutcome {
	pub user_id: String,
	/// False when the event repeated an already-counted completion.
	pub counted: bool,
	pub skills: Vec<SkillUpdate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
	pub profile: Option<UserProfile>,
	pub history: UserHistory,
}

/// `10 * (1 - e^(-(c + 2a + 0.5h) / 8))`, in `[0, 10)`.
pub fn proficiency(stats: &SkillStats) -> f64 {
	let effort = stats.completions as f64 * COMPLETION_WEIGHT
		+ stats.applications as f64 * APPLICATION_WEIGHT
		+ (stats.minutes / 60.0) * HOUR_WEIGHT;
	10.0 * (1.0 - (-effort / PROFICIENCY_SCALE).exp())
}

// ---------------------------------------------------------------------------
// UserStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct UserCell {
	profile: Option<UserProfile>,
	history: UserHistory,
}

#[derive(Default)]
pub struct UserStore {
	users: RwLock<HashMap<String, Arc<Mutex<UserCell>>>>,
}

impl UserStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		self.users.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn user_ids(&self) -> Vec<String> {
		let mut ids: Vec<String> = self.users.read().keys().cloned().collect();
		ids.sort();
		ids
	}

	fn cell(&self, user_id: &str) -> Option<Arc<Mutex<UserCell>>> {
		self.users.read().get(user_id).cloned()
	}

	fn cell_or_create(&self, user_id: &str) -> Arc<Mutex<UserCell>> {
		if let Some(cell) = self.cell(user_id) {
			return cell;
		}
		self.users
			.write()
			.entry(user_id.to_string())
			.or_insert_with(|| {
				Arc::new(Mutex::new(UserCell {
					profile: None,
					history: UserHistory::new(user_id),
				}))
			})
			.clone()
	}

	/// Store static fields from the profile system. `preferred_tags` must
	/// already be canonical.
	pub fn upsert_profile(
		&self,
		user_id: &str,
		preferred_tags: Vec<String>,
		preferred_modes: Vec<LearningMode>,
		now: u64,
	) -> Result<UserProfile, EngineError> {
		if user_id.trim().is_empty() {
			return Err(EngineError::InvalidParams("userId must not be empty".into()));
		}
		let profile = UserProfile {
			user_id: user_id.to_string(),
			preferred_tags,
			preferred_modes,
			updated_at: now,
		};
		self.cell_or_create(user_id).lock().profile = Some(profile.clone());
		Ok(profile)
	}

	pub fn profile(&self, user_id: &str) -> Option<UserProfile> {
		self.cell(user_id).and_then(|c| c.lock().profile.clone())
	}

	pub fn history(&self, user_id: &str) -> Option<UserHistory> {
		self.cell(user_id).map(|c| c.lock().history.clone())
	}

	/// Profile and history in one lock acquisition.
	pub fn view(&self, user_id: &str) -> (Option<UserProfile>, Option<UserHistory>) {
		match self.cell(user_id) {
			Some(cell) => {
				let cell = cell.lock();
				(cell.profile.clone(), Some(cell.history.clone()))
			}
			None => (None, None),
		}
	}

	/// Apply one activity event. `skills` are the content's canonical tags.
	/// Only the touched skills are recomputed.
	pub fn record_event(
		&self,
		event: &ActivityEvent,
		skills: &[String],
		now: u64,
	) -> Result<EventOutcome, EngineError> {
		if event.user_id.trim().is_empty() {
			return Err(EngineError::InvalidParams("userId must not be empty".into()));
		}
		if !event.minutes.is_finite() || event.minutes < 0.0 {
			return Err(EngineError::InvalidParams(
				"minutes must be a non-negative number".into(),
			));
		}
		let at = event.timestamp.unwrap_or(now);
		let cell = self.cell_or_create(&event.user_id);
		let mut cell = cell.lock();
		let history = &mut cell.history;

		let duplicate = event.kind == ActivityKind::Completed
			&& history.completed.contains(&event.content_id);
		if duplicate {
			tracing::debug!(
				user = %event.user_id,
				content = %event.content_id,
				"Ignoring repeated completion"
			);
			return Ok(EventOutcome {
				user_id: event.user_id.clone(),
				counted: false,
				skills: Vec::new(),
			});
		}

		history.events += 1;
		history.updated_at = now;
		let newer = history
			.latest_interaction
			.as_ref()
			.map_or(true, |prev| at >= prev.at);
		if newer {
			history.latest_interaction = Some(Interaction {
				content_id: event.content_id.clone(),
				kind: event.kind,
				at,
			});
		}

		if event.kind == ActivityKind::Completed {
			history.completed.insert(event.content_id.clone());
			history.completions.push_back((event.content_id.clone(), at));
		}

		let mut updates = Vec::with_capacity(skills.len());
		for skill in skills {
			let mut stats = history.skills.get(skill).cloned().unwrap_or_default();
			match event.kind {
				ActivityKind::Completed => stats.completions += 1,
				ActivityKind::Applied => stats.applications += 1,
				ActivityKind::Progress => {}
			}
			stats.minutes += event.minutes;
			stats.proficiency = proficiency(&stats);
			updates.push(SkillUpdate {
				skill: skill.clone(),
				proficiency: stats.proficiency,
			});
			history.skills.insert(skill.clone(), stats);
		}

		Ok(EventOutcome {
			user_id: event.user_id.clone(),
			counted: true,
			skills: updates,
		})
	}

	// -- Persistence ---------------------------------------------------------

	pub fn export(&self) -> Vec<UserRecord> {
		let cells: Vec<Arc<Mutex<UserCell>>> = self.users.read().values().cloned().collect();
		let mut records: Vec<UserRecord> = cells
			.iter()
			.map(|c| {
				let c = c.lock();
				UserRecord {
					profile: c.profile.clone(),
					history: c.history.clone(),
				}
			})
			.collect();
		records.sort_by(|a, b| a.history.user_id.cmp(&b.history.user_id));
		records
	}

	pub fn restore(&self, records: Vec<UserRecord>) {
		let mut users = self.users.write();
		users.clear();
		for rec in records {
			users.insert(
				rec.history.user_id.clone(),
				Arc::new(Mutex::new(UserCell {
					profile: rec.profile,
					history: rec.history,
				})),
			);
		}
	}
}
