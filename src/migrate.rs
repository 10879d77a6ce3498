//! Helpers for bundling the ledger's SQL migrations with your own.

/// Extend an `sqlx::migrate!()` call with the `job_records` table migrations.
///
/// ```ignore
/// use lane_jobs::IncludeMigrations;
///
/// sqlx::migrate!()
///     .include_job_ledger_migrations()
///     .run(&pool)
///     .await?;
/// ```
pub trait IncludeMigrations {
    /// Append the ledger migrations to the current migrator.
    fn include_job_ledger_migrations(&mut self) -> &mut Self;
}

impl IncludeMigrations for sqlx::migrate::Migrator {
    fn include_job_ledger_migrations(&mut self) -> &mut Self {
        let mut migrations = self.migrations.to_vec();
        for migration in sqlx::migrate!().migrations.iter() {
            if !migrations.iter().any(|m| m.version == migration.version) {
                migrations.push(migration.clone());
            }
        }
        migrations.sort_by_key(|m| m.version);
        self.migrations = std::borrow::Cow::Owned(migrations);
        self
    }
}
