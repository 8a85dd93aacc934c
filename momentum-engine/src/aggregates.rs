// ---------------------------------------------------------------------------
// Aggregate payloads
// ---------------------------------------------------------------------------
//
// Builders for the analytics published into the aggregate cache. Each one
// reads the live stores once and returns a self-contained value; none of
// them mutate anything.
// ---------------------------------------------------------------------------

use serde::Serialize;

use crate::content::ContentCatalog;
use crate::error::EngineError;
use crate::profile::UserStore;
use crate::topics::{relation, TopicRelation};
use crate::trend::{TopicTrend, TrendStatus, TrendStore};

const TOP_SKILLS: usize = 5;

// -- User analytics ---------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillSummary {
	pub skill: String,
	pub proficiency: f64,
	pub completions: u32,
	pub applications: u32,
	pub minutes: f64,
	/// Trend status of the skill's topic, when it has one.
	pub trend: Option<TrendStatus>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAnalytics {
	pub user_id: String,
	pub has_profile: bool,
	pub preferred_tags: Vec<String>,
	pub completed: usize,
	pub events: u64,
	pub minutes_invested: f64,
	pub mean_proficiency: f64,
	pub skills: Vec<SkillSummary>,
	pub top_skills: Vec<String>,
	/// Skills whose topic is currently rising.
	pub rising_skills: Vec<String>,
	pub last_active_at: Option<u64>,
}

/// Analytics for one user. Unknown users produce an empty summary.
pub fn user_analytics(users: &UserStore, trends: &TrendStore, user_id: &str) -> UserAnalytics {
	let (profile, history) = users.view(user_id);
	let history = history.unwrap_or_default();

	let mut skills: Vec<SkillSummary> = history
		.skills
		.iter()
		.map(|(skill, stats)| SkillSummary {
			skill: skill.clone(),
			proficiency: stats.proficiency,
			completions: stats.completions,
			applications: stats.applications,
			minutes: stats.minutes,
			trend: trends.get(skill).map(|t| t.status),
		})
		.collect();
	skills.sort_by(|a, b| {
		b.proficiency
			.total_cmp(&a.proficiency)
			.then_with(|| a.skill.cmp(&b.skill))
	});

	let minutes_invested: f64 = skills.iter().map(|s| s.minutes).sum();
	let mean_proficiency = if skills.is_empty() {
		0.0
	} else {
		skills.iter().map(|s| s.proficiency).sum::<f64>() / skills.len() as f64
	};

	UserAnalytics {
		user_id: user_id.to_string(),
		has_profile: profile.is_some(),
		preferred_tags: profile.map(|p| p.preferred_tags).unwrap_or_default(),
		completed: history.completed.len(),
		events: history.events,
		minutes_invested,
		mean_proficiency,
		top_skills: skills.iter().take(TOP_SKILLS).map(|s| s.skill.clone()).collect(),
		rising_skills: skills
			.iter()
			.filter(|s| s.trend == Some(TrendStatus::Rising))
			.map(|s| s.skill.clone())
			.collect(),
		skills,
		last_active_at: history.latest_interaction.map(|i| i.at),
	}
}

// -- Topic health -----------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicHealth {
	pub topic: String,
	pub trend: Option<TopicTrend>,
	/// Live items tagged with the topic itself.
	pub exact_content: usize,
	/// Live items tagged with the topic or any subtopic.
	pub live_content: usize,
	pub learners: usize,
	pub mean_proficiency: f64,
}

/// Health of one topic. Fails for a topic that has neither signals nor
/// content, so a refresh for a mistyped key backs off instead of publishing
/// an empty snapshot.
pub fn topic_health(
	trends: &TrendStore,
	catalog: &ContentCatalog,
	users: &UserStore,
	topic: &str,
) -> Result<TopicHealth, EngineError> {
	let mut exact_content = 0;
	let mut live_content = 0;
	for item in catalog.live_items() {
		let mut under = false;
		for tag in &item.tags {
			match relation(tag, topic) {
				TopicRelation::Same => {
					exact_content += 1;
					under = true;
					break;
				}
				TopicRelation::Descendant => under = true,
				_ => {}
			}
		}
		if under {
			live_content += 1;
		}
	}

	let trend = trends.get(topic);
	if trend.is_none() && live_content == 0 {
		return Err(EngineError::NotFound(format!("topic '{}'", topic)));
	}

	let mut learners = 0;
	let mut proficiency_sum = 0.0;
	for user_id in users.user_ids() {
		let Some(history) = users.history(&user_id) else {
			continue;
		};
		if let Some(stats) = history.skills.get(topic) {
			learners += 1;
			proficiency_sum += stats.proficiency;
		}
	}

	Ok(TopicHealth {
		topic: topic.to_string(),
		trend,
		exact_content,
		live_content,
		learners,
		mean_proficiency: if learners == 0 {
			0.0
		} else {
			proficiency_sum / learners as f64
		},
	})
}

// -- Leaderboard ------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Leaderboard {
	pub window: u64,
	pub topics: Vec<TopicTrend>,
	pub rising: usize,
	pub falling: usize,
}

pub fn leaderboard(trends: &TrendStore, n: usize, now: u64) -> Leaderboard {
	let topics = trends.leaderboard(n);
	Leaderboard {
		window: trends.window_of(now),
		rising: topics.iter().filter(|t| t.status == TrendStatus::Rising).count(),
		falling: topics.iter().filter(|t| t.status == TrendStatus::Falling).count(),
		topics,
	}
}
