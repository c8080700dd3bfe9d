//! Scoreboard assembly with the canonical ordering.

use chrono::{DateTime, Utc};
use serde::Serialize;

use koth_state::{Competition, StateStore, TeamId};

use crate::error::ScoringResult;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScoreboardCheck {
    pub id: String,
    pub name: String,
    pub passed: bool,
    pub pass_points: i64,
    pub fail_points: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScoreboardContainer {
    pub name: String,
    pub checks: Vec<ScoreboardCheck>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScoreboardTeam {
    pub id: TeamId,
    pub name: String,
    pub score: i64,
    pub last_updated: DateTime<Utc>,
    pub containers: Vec<ScoreboardContainer>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScoreboardCompetition {
    #[serde(rename = "competitionID")]
    pub competition_id: String,
    pub name: String,
    pub description: String,
    pub host: String,
    pub team_count: usize,
    pub container_count: usize,
    pub is_private: bool,
    pub teams: Vec<ScoreboardTeam>,
}

/// Assemble one competition's scoreboard.
///
/// Containers order by `container_order` then lowercased name; checks by
/// `check_order`; teams by score descending, then name ascending, then
/// last-updated descending.
pub fn build_scoreboard_competition(
    store: &StateStore,
    comp: &Competition,
) -> ScoringResult<ScoreboardCompetition> {
    let mut teams = Vec::new();

    for &team_id in &comp.team_ids {
        let Some(team) = store.get_team(team_id)? else {
            continue;
        };

        teams.push(ScoreboardTeam {
            id: team.id,
            name: team.name.clone(),
            score: team.score,
            last_updated: team.last_updated,
            containers: load_team_containers(store, team_id)?,
        });
    }

    teams.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
            .then_with(|| b.last_updated.cmp(&a.last_updated))
    });

    Ok(ScoreboardCompetition {
        competition_id: comp.system_id.clone(),
        name: comp.name.clone(),
        description: comp.description.clone(),
        host: comp.host.clone(),
        team_count: comp.team_ids.len(),
        container_count: comp.container_ids.len(),
        is_private: comp.is_private,
        teams,
    })
}

/// Group a team's score rows into per-container check lists.
fn load_team_containers(
    store: &StateStore,
    team_id: TeamId,
) -> ScoringResult<Vec<ScoreboardContainer>> {
    let mut records = store.list_team_results(team_id)?;

    records.sort_by(|a, b| {
        a.container_order
            .cmp(&b.container_order)
            .then_with(|| {
                a.container_name
                    .to_lowercase()
                    .cmp(&b.container_name.to_lowercase())
            })
            .then_with(|| a.check_order.cmp(&b.check_order))
    });

    let mut containers: Vec<ScoreboardContainer> = Vec::new();
    for record in records {
        let matches_last = containers
            .last()
            .is_some_and(|c| c.name.eq_ignore_ascii_case(&record.container_name));
        if !matches_last {
            containers.push(ScoreboardContainer {
                name: record.container_name.clone(),
                checks: Vec::new(),
            });
        }

        if let Some(current) = containers.last_mut() {
            current.checks.push(ScoreboardCheck {
                id: record.check_id,
                name: record.check_name,
                passed: record.passed,
                pass_points: record.pass_points,
                fail_points: record.fail_points,
            });
        }
    }

    Ok(containers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use koth_state::{ContainerRestrictions, ScoreResult, Team};

    fn store_with_team(id_offset: i64, name: &str, score: i64) -> (StateStore, Team) {
        let store = StateStore::open_in_memory().unwrap();
        let team = team(name, score, id_offset);
        store.put_team(&team).unwrap();
        (store, team)
    }

    fn team(name: &str, score: i64, id: i64) -> Team {
        Team {
            id,
            name: name.to_string(),
            score,
            network_cidr: "10.0.0.0/24".to_string(),
            container_ids: Vec::new(),
            last_updated: Utc::now(),
            created_at: Utc::now(),
        }
    }

    fn comp_for(teams: &[&Team]) -> Competition {
        Competition {
            system_id: "demo".to_string(),
            name: "Demo".to_string(),
            description: String::new(),
            host: String::new(),
            is_private: false,
            allowed_groups: Vec::new(),
            created_at: Utc::now(),
            package_path: String::new(),
            setup_public_folder: "public".to_string(),
            network_cidr: "10.0.0.0/16".to_string(),
            restrictions: ContainerRestrictions::default(),
            ssh_pub_key_path: String::new(),
            ssh_priv_key_path: String::new(),
            team_ids: teams.iter().map(|t| t.id).collect(),
            container_ids: Vec::new(),
            scoring_active: true,
        }
    }

    fn row(
        team_id: i64,
        container: &str,
        container_order: u32,
        check: &str,
        check_order: u32,
        passed: bool,
    ) -> ScoreResult {
        ScoreResult {
            team_id,
            container_name: container.to_string(),
            container_order,
            check_id: check.to_string(),
            check_name: check.to_uppercase(),
            check_order,
            pass_points: 10,
            fail_points: -5,
            passed,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn containers_and_checks_follow_declared_order() {
        let (store, team) = store_with_team(1, "Team 1", 0);
        store
            .replace_team_results(
                team.id,
                &[
                    row(team.id, "db", 1, "tcp_3306", 0, true),
                    row(team.id, "Web", 0, "tls", 1, false),
                    row(team.id, "Web", 0, "http_200", 0, true),
                ],
            )
            .unwrap();

        let board = build_scoreboard_competition(&store, &comp_for(&[&team])).unwrap();
        let containers = &board.teams[0].containers;

        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0].name, "Web");
        assert_eq!(containers[0].checks[0].id, "http_200");
        assert_eq!(containers[0].checks[1].id, "tls");
        assert_eq!(containers[1].name, "db");
    }

    #[test]
    fn teams_rank_by_score_then_name_then_recency() {
        let store = StateStore::open_in_memory().unwrap();

        let mut alpha = team("alpha", 50, 1);
        let mut beta = team("Beta", 50, 2);
        let gamma = team("gamma", 70, 3);
        alpha.last_updated = Utc::now() - Duration::minutes(5);
        beta.last_updated = Utc::now();

        for t in [&alpha, &beta, &gamma] {
            store.put_team(t).unwrap();
        }

        let board =
            build_scoreboard_competition(&store, &comp_for(&[&alpha, &beta, &gamma])).unwrap();
        let names: Vec<&str> = board.teams.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["gamma", "alpha", "Beta"]);
    }

    #[test]
    fn missing_teams_are_skipped() {
        let (store, team) = store_with_team(1, "Team 1", 0);
        let mut comp = comp_for(&[&team]);
        comp.team_ids.push(999);

        let board = build_scoreboard_competition(&store, &comp).unwrap();
        assert_eq!(board.teams.len(), 1);
        assert_eq!(board.team_count, 2);
    }
}
