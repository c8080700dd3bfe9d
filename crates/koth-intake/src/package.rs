//! Package validation and materialization.

use std::path::Path;

use chrono::Utc;
use koth_core::config::RestrictionCaps;
use koth_core::sanitize::{path_within_base, sanitize_identifier};
use koth_core::spec::CompetitionConfig;
use koth_state::{CompetitionPackage, StateStore};
use tracing::{debug, info};

use crate::archive::IntakePlan;
use crate::error::IntakeError;

/// A competition id must be non-empty and collide with neither an active
/// competition nor a previously uploaded package (case-insensitive).
pub fn ensure_competition_id_available(
    store: &StateStore,
    competition_id: &str,
) -> Result<(), IntakeError> {
    let trimmed = competition_id.trim();
    if trimmed.is_empty() {
        return Err(IntakeError::IdMissing);
    }

    let needle = trimmed.to_lowercase();
    for comp in store.list_competitions()? {
        if comp.system_id.to_lowercase() == needle {
            return Err(IntakeError::IdConflict(format!("{trimmed} is already active")));
        }
    }
    for package in store.list_packages()? {
        if package.competition_id.to_lowercase() == needle {
            return Err(IntakeError::IdConflict(format!(
                "{trimmed} has already been uploaded"
            )));
        }
    }

    Ok(())
}

/// Check the uploaded container spec against the operator's caps.
pub fn validate_restrictions(
    config: &CompetitionConfig,
    caps: &RestrictionCaps,
) -> Result<(), IntakeError> {
    let specs = &config.container_specs;

    if !caps.allowed_templates.is_empty()
        && !caps.allowed_templates.iter().any(|t| t == &specs.template_path)
    {
        return Err(IntakeError::RestrictionViolation(format!(
            "template {:?} is not allowed",
            specs.template_path
        )));
    }

    if !caps.allowed_storage_pools.is_empty()
        && !caps.allowed_storage_pools.iter().any(|p| p == &specs.storage_pool)
    {
        return Err(IntakeError::RestrictionViolation(format!(
            "storage pool {:?} is not allowed",
            specs.storage_pool
        )));
    }

    if specs.cores > caps.max_cores {
        return Err(IntakeError::RestrictionViolation(format!(
            "{} cores exceeds the cap of {}",
            specs.cores, caps.max_cores
        )));
    }
    if specs.memory_mb > caps.max_memory_mb {
        return Err(IntakeError::RestrictionViolation(format!(
            "{} MB memory exceeds the cap of {}",
            specs.memory_mb, caps.max_memory_mb
        )));
    }
    if specs.storage_size_gb > caps.max_disk_gb {
        return Err(IntakeError::RestrictionViolation(format!(
            "{} GB disk exceeds the cap of {}",
            specs.storage_size_gb, caps.max_disk_gb
        )));
    }

    Ok(())
}

/// Write the package to `<storage>/packages/<sanitized-id>-<nanos>/` and
/// persist the package record.
pub fn materialize_package(
    store: &StateStore,
    storage_base: &Path,
    plan: &IntakePlan,
    original_filename: &str,
) -> Result<CompetitionPackage, IntakeError> {
    let packages_dir = storage_base.join("packages");
    std::fs::create_dir_all(&packages_dir)?;

    let mut sanitized = sanitize_identifier(&plan.config.competition_id);
    if sanitized.is_empty() {
        sanitized = "competition".to_string();
    }

    let created_at = Utc::now();
    let nanos = created_at.timestamp_nanos_opt().unwrap_or_default();
    let package_dir = packages_dir.join(format!("{sanitized}-{nanos}"));
    std::fs::create_dir_all(&package_dir)?;

    let config_path = package_dir.join("config.json");
    std::fs::write(&config_path, &plan.config_bytes)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&config_path, std::fs::Permissions::from_mode(0o600))?;
    }

    for attachment in &plan.attachments {
        let relative = attachment.relative_path.trim_start_matches('/');
        if relative.is_empty() {
            continue;
        }

        let destination = package_dir.join(relative);
        if !path_within_base(&package_dir, &destination) {
            return Err(IntakeError::AttachmentEscape(relative.to_string()));
        }

        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&destination, &attachment.content)?;
        debug!(path = %destination.display(), bytes = attachment.content.len(), "attachment written");
    }

    let record = CompetitionPackage {
        competition_id: plan.config.competition_id.clone(),
        competition_name: plan.config.competition_name.clone(),
        original_filename: original_filename.to_string(),
        storage_path: package_dir.display().to_string(),
        config_json: plan.config_bytes.clone(),
        attachment_count: plan.attachments.len() as u32,
        created_at,
    };
    store.put_package(&record)?;

    info!(
        competition_id = %record.competition_id,
        path = %record.storage_path,
        attachments = record.attachment_count,
        "competition package stored"
    );
    Ok(record)
}
