//! StateStore — redb-backed persistence for KOTH records.
//!
//! Provides typed CRUD operations over competitions, teams, container
//! records, score results and packages. All values are JSON-serialized
//! into redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe record store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(COMPETITIONS).map_err(map_err!(Table))?;
        txn.open_table(TEAMS).map_err(map_err!(Table))?;
        txn.open_table(CONTAINERS).map_err(map_err!(Table))?;
        txn.open_table(SCORE_RESULTS).map_err(map_err!(Table))?;
        txn.open_table(PACKAGES).map_err(map_err!(Table))?;
        txn.open_table(COUNTERS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn put_raw<T: serde::Serialize>(
        &self,
        table: redb::TableDefinition<&str, &[u8]>,
        key: &str,
        value: &T,
    ) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_raw<T: serde::de::DeserializeOwned>(
        &self,
        table: redb::TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn list_raw<T: serde::de::DeserializeOwned>(
        &self,
        table: redb::TableDefinition<&str, &[u8]>,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: T =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    fn delete_raw(
        &self,
        table: redb::TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Competitions ───────────────────────────────────────────────

    /// Insert or update a competition record.
    pub fn put_competition(&self, comp: &Competition) -> StateResult<()> {
        self.put_raw(COMPETITIONS, &comp.system_id, comp)?;
        debug!(system_id = %comp.system_id, "competition stored");
        Ok(())
    }

    /// Get a competition by exact system id.
    pub fn get_competition(&self, system_id: &str) -> StateResult<Option<Competition>> {
        self.get_raw(COMPETITIONS, system_id)
    }

    /// Get a competition by system id, case-insensitive.
    pub fn find_competition(&self, system_id: &str) -> StateResult<Option<Competition>> {
        if let Some(comp) = self.get_competition(system_id)? {
            return Ok(Some(comp));
        }
        let needle = system_id.trim().to_lowercase();
        Ok(self
            .list_competitions()?
            .into_iter()
            .find(|c| c.system_id.to_lowercase() == needle))
    }

    /// List all competitions.
    pub fn list_competitions(&self) -> StateResult<Vec<Competition>> {
        self.list_raw(COMPETITIONS)
    }

    /// Delete a competition by system id. Returns true if it existed.
    pub fn delete_competition(&self, system_id: &str) -> StateResult<bool> {
        let existed = self.delete_raw(COMPETITIONS, system_id)?;
        debug!(%system_id, existed, "competition deleted");
        Ok(existed)
    }

    // ── Teams ──────────────────────────────────────────────────────

    /// Insert a new team, allocating its id from the counter table.
    pub fn insert_team(&self, team: &mut Team) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut counters = txn.open_table(COUNTERS).map_err(map_err!(Table))?;
            let next = counters
                .get("team_id")
                .map_err(map_err!(Read))?
                .map(|g| g.value())
                .unwrap_or(0)
                + 1;
            counters.insert("team_id", next).map_err(map_err!(Write))?;
            team.id = next as TeamId;

            let bytes = serde_json::to_vec(&*team).map_err(map_err!(Serialize))?;
            let mut teams = txn.open_table(TEAMS).map_err(map_err!(Table))?;
            teams
                .insert(Team::table_key(team.id).as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Update an existing team record.
    pub fn put_team(&self, team: &Team) -> StateResult<()> {
        self.put_raw(TEAMS, &Team::table_key(team.id), team)
    }

    /// Get a team by id.
    pub fn get_team(&self, id: TeamId) -> StateResult<Option<Team>> {
        self.get_raw(TEAMS, &Team::table_key(id))
    }

    /// Delete a team by id. Returns true if it existed.
    pub fn delete_team(&self, id: TeamId) -> StateResult<bool> {
        self.delete_raw(TEAMS, &Team::table_key(id))
    }

    // ── Container records ──────────────────────────────────────────

    /// Insert or update a container record.
    pub fn put_container(&self, record: &ContainerRecord) -> StateResult<()> {
        self.put_raw(CONTAINERS, &ContainerRecord::table_key(record.ctid), record)
    }

    /// Get a container record by CTID.
    pub fn get_container(&self, ctid: ContainerId) -> StateResult<Option<ContainerRecord>> {
        self.get_raw(CONTAINERS, &ContainerRecord::table_key(ctid))
    }

    /// List all container records.
    pub fn list_containers(&self) -> StateResult<Vec<ContainerRecord>> {
        self.list_raw(CONTAINERS)
    }

    /// Find the container a team runs for a given config name.
    pub fn find_container_for_team(
        &self,
        team_id: TeamId,
        config_name: &str,
    ) -> StateResult<Option<ContainerRecord>> {
        let needle = config_name.trim().to_lowercase();
        Ok(self
            .list_containers()?
            .into_iter()
            .find(|c| c.team_id == team_id && c.config_name.trim().to_lowercase() == needle))
    }

    /// Delete a container record. Returns true if it existed.
    pub fn delete_container(&self, ctid: ContainerId) -> StateResult<bool> {
        self.delete_raw(CONTAINERS, &ContainerRecord::table_key(ctid))
    }

    // ── Score results ──────────────────────────────────────────────

    /// Replace all score results for a team with the given set.
    ///
    /// Executed as one write transaction so a scoring pass never leaves a
    /// team with a half-updated result set.
    pub fn replace_team_results(
        &self,
        team_id: TeamId,
        results: &[ScoreResult],
    ) -> StateResult<()> {
        let prefix = ScoreResult::team_prefix(team_id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SCORE_RESULTS).map_err(map_err!(Table))?;
            let stale: Vec<String> = table
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    let k = key.value().to_string();
                    k.starts_with(&prefix).then_some(k)
                })
                .collect();
            for key in &stale {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            for result in results {
                let bytes = serde_json::to_vec(result).map_err(map_err!(Serialize))?;
                table
                    .insert(result.table_key().as_str(), bytes.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// List a team's score results in key order
    /// (container order, then check order).
    pub fn list_team_results(&self, team_id: TeamId) -> StateResult<Vec<ScoreResult>> {
        let prefix = ScoreResult::team_prefix(team_id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SCORE_RESULTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let record: ScoreResult =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(record);
            }
        }
        Ok(results)
    }

    /// Delete all score results for a team. Returns number deleted.
    pub fn delete_team_results(&self, team_id: TeamId) -> StateResult<u32> {
        let count = self.list_team_results(team_id)?.len() as u32;
        self.replace_team_results(team_id, &[])?;
        Ok(count)
    }

    // ── Packages ───────────────────────────────────────────────────

    /// Insert or update a package record.
    pub fn put_package(&self, package: &CompetitionPackage) -> StateResult<()> {
        self.put_raw(
            PACKAGES,
            &CompetitionPackage::table_key(&package.competition_id),
            package,
        )
    }

    /// Get a package by competition id (case-insensitive).
    pub fn get_package(&self, competition_id: &str) -> StateResult<Option<CompetitionPackage>> {
        self.get_raw(PACKAGES, &CompetitionPackage::table_key(competition_id))
    }

    /// List all stored packages.
    pub fn list_packages(&self) -> StateResult<Vec<CompetitionPackage>> {
        self.list_raw(PACKAGES)
    }

    /// Delete a package record. Returns true if it existed.
    pub fn delete_package(&self, competition_id: &str) -> StateResult<bool> {
        self.delete_raw(PACKAGES, &CompetitionPackage::table_key(competition_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn test_competition(system_id: &str) -> Competition {
        Competition {
            system_id: system_id.to_string(),
            name: format!("{system_id} comp"),
            description: String::new(),
            host: "UNH".to_string(),
            is_private: false,
            allowed_groups: Vec::new(),
            created_at: Utc::now(),
            package_path: "/tmp/pkg".to_string(),
            setup_public_folder: "public".to_string(),
            network_cidr: "10.0.0.0/16".to_string(),
            restrictions: ContainerRestrictions::default(),
            ssh_pub_key_path: String::new(),
            ssh_priv_key_path: String::new(),
            team_ids: Vec::new(),
            container_ids: Vec::new(),
            scoring_active: false,
        }
    }

    fn test_team(name: &str) -> Team {
        Team {
            id: 0,
            name: name.to_string(),
            score: 0,
            network_cidr: "10.0.0.0/24".to_string(),
            container_ids: Vec::new(),
            last_updated: Utc::now(),
            created_at: Utc::now(),
        }
    }

    fn test_result(team_id: TeamId, container_order: u32, check_order: u32) -> ScoreResult {
        ScoreResult {
            team_id,
            container_name: "web".to_string(),
            container_order,
            check_id: format!("check-{container_order}-{check_order}"),
            check_name: "Check".to_string(),
            check_order,
            pass_points: 10,
            fail_points: -5,
            passed: check_order % 2 == 0,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn competition_crud_round_trips() {
        let store = StateStore::open_in_memory().unwrap();
        let comp = test_competition("demo");

        store.put_competition(&comp).unwrap();
        assert_eq!(store.get_competition("demo").unwrap(), Some(comp.clone()));
        assert_eq!(store.find_competition("DEMO").unwrap(), Some(comp));

        assert!(store.delete_competition("demo").unwrap());
        assert!(!store.delete_competition("demo").unwrap());
        assert!(store.get_competition("demo").unwrap().is_none());
    }

    #[test]
    fn team_ids_are_allocated_monotonically() {
        let store = StateStore::open_in_memory().unwrap();

        let mut first = test_team("Team 1");
        let mut second = test_team("Team 2");
        store.insert_team(&mut first).unwrap();
        store.insert_team(&mut second).unwrap();

        assert!(second.id > first.id);
        assert_eq!(store.get_team(first.id).unwrap().unwrap().name, "Team 1");
    }

    #[test]
    fn container_lookup_by_team_and_config() {
        let store = StateStore::open_in_memory().unwrap();
        let record = ContainerRecord {
            ctid: 101,
            ip_address: "10.0.0.10".to_string(),
            status: ContainerStatus::Running,
            team_id: 3,
            config_name: "Web".to_string(),
            storage_pool: "team".to_string(),
            node_name: "pve1".to_string(),
            last_updated: Utc::now(),
            created_at: Utc::now(),
        };
        store.put_container(&record).unwrap();

        let found = store.find_container_for_team(3, "web").unwrap();
        assert_eq!(found.map(|c| c.ctid), Some(101));
        assert!(store.find_container_for_team(4, "web").unwrap().is_none());
    }

    #[test]
    fn replace_team_results_is_delete_then_insert() {
        let store = StateStore::open_in_memory().unwrap();

        store
            .replace_team_results(1, &[test_result(1, 0, 0), test_result(1, 0, 1)])
            .unwrap();
        store.replace_team_results(12, &[test_result(12, 0, 0)]).unwrap();

        // Replacing team 1 leaves team 12 untouched.
        store.replace_team_results(1, &[test_result(1, 1, 0)]).unwrap();

        let team1 = store.list_team_results(1).unwrap();
        assert_eq!(team1.len(), 1);
        assert_eq!(team1[0].container_order, 1);
        assert_eq!(store.list_team_results(12).unwrap().len(), 1);
    }

    #[test]
    fn team_results_come_back_in_container_then_check_order() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .replace_team_results(
                5,
                &[test_result(5, 1, 0), test_result(5, 0, 1), test_result(5, 0, 0)],
            )
            .unwrap();

        let results = store.list_team_results(5).unwrap();
        let order: Vec<(u32, u32)> = results
            .iter()
            .map(|r| (r.container_order, r.check_order))
            .collect();
        assert_eq!(order, vec![(0, 0), (0, 1), (1, 0)]);
    }

    #[test]
    fn package_keys_are_case_insensitive() {
        let store = StateStore::open_in_memory().unwrap();
        let package = CompetitionPackage {
            competition_id: "Demo".to_string(),
            competition_name: "Demo Comp".to_string(),
            original_filename: "demo.zip".to_string(),
            storage_path: "/tmp/packages/demo-1".to_string(),
            config_json: b"{}".to_vec(),
            attachment_count: 0,
            created_at: Utc::now(),
        };
        store.put_package(&package).unwrap();

        assert!(store.get_package("demo").unwrap().is_some());
        assert!(store.get_package("DEMO").unwrap().is_some());
        assert!(store.delete_package("dEmO").unwrap());
    }
}
