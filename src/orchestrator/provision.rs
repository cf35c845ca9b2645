//! Instance provisioning and disposal callouts.
//!
//! When `instance_provision` is configured, workers run inside externally
//! provisioned environments. This module keeps the [`InstancePool`] topped
//! up to the run's concurrency per profile, hands instances to workers,
//! and tears everything down through `instance_dispose` when the
//! controller winds down.

use crate::config::TestConfig;
use crate::connector::Connector;
use crate::errors::QuarryError;
use crate::instance::{Instance, InstancePool};
use crate::subst::expand;
use crate::ui::Ui;

/// Source of worker instances for one controller lifetime.
///
/// Not thread-safe: the controller serialises all access between worker
/// batches, per the pool contract.
pub struct InstanceSource<'a> {
    connector: &'a dyn Connector,
    ui: &'a dyn Ui,
    config: &'a TestConfig,
    concurrency: usize,
    pool: InstancePool,
}

impl<'a> InstanceSource<'a> {
    pub fn new(
        connector: &'a dyn Connector,
        ui: &'a dyn Ui,
        config: &'a TestConfig,
        concurrency: usize,
    ) -> Self {
        InstanceSource {
            connector,
            ui,
            config,
            concurrency,
            pool: InstancePool::new(),
        }
    }

    /// Obtains an instance for `profile`, provisioning more when the pool
    /// holds fewer than the run's concurrency.
    ///
    /// Returns `None` when `instance_provision` is not configured: workers
    /// then run directly, unwrapped.
    pub async fn obtain_instance(
        &mut self,
        profile: &str,
    ) -> Result<Option<Instance>, QuarryError> {
        let Some(template) = self.config.instance_provision() else {
            return Ok(None);
        };
        while self.pool.size(profile) < self.concurrency {
            let wanted = self.concurrency - self.pool.size(profile);
            let cmd = expand(
                template,
                &[
                    ("INSTANCE_COUNT", &wanted.to_string()),
                    ("PROFILE", profile),
                ],
            );
            self.ui.output_values(&[("running", cmd.clone())]);
            let output = self.connector.run(&cmd).await?;
            if !output.success() {
                return Err(QuarryError::ProvisionFailed {
                    code: output.exit_code,
                    stderr: output.stderr_text(),
                });
            }
            let stdout = output.stdout_text();
            let tokens: Vec<&str> = stdout.split_whitespace().collect();
            if tokens.is_empty() {
                // A provisioner that reports success but yields nothing
                // would spin this loop forever.
                return Err(QuarryError::ProvisionFailed {
                    code: 0,
                    stderr: "instance_provision produced no instance ids".into(),
                });
            }
            for token in tokens {
                self.pool.add(Instance::new(profile, token)?);
            }
        }
        Ok(Some(self.pool.allocate(profile)?))
    }

    /// Returns an instance to the pool for reuse.
    pub fn release_instance(&mut self, instance: &Instance) -> Result<(), QuarryError> {
        self.pool.release(instance)?;
        Ok(())
    }

    /// Disposes every provisioned instance via `instance_dispose`.
    ///
    /// The pool is cleared whether or not the callout succeeds; a non-zero
    /// exit is still fatal so the user hears about leaked environments.
    pub async fn dispose_all(&mut self) -> Result<(), QuarryError> {
        let instances = self.pool.all();
        self.pool.clear();
        let Some(template) = self.config.instance_dispose() else {
            return Ok(());
        };
        if instances.is_empty() {
            return Ok(());
        }
        let mut ids: Vec<&str> = instances.iter().map(Instance::id).collect();
        ids.sort_unstable();
        let ids = ids.join(" ");
        let cmd = expand(template, &[("INSTANCE_IDS", &ids)]);
        self.ui.output_values(&[("running", cmd.clone())]);
        let output = self.connector.run(&cmd).await?;
        if !output.success() {
            return Err(QuarryError::DisposeFailed {
                code: output.exit_code,
                stderr: output.stderr_text(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::ShellConnector;
    use crate::ui::MemoryUi;

    fn config(text: &str) -> TestConfig {
        TestConfig::parse(text).unwrap()
    }

    #[tokio::test]
    async fn unconfigured_provision_yields_none() {
        let connector = ShellConnector::new();
        let ui = MemoryUi::new();
        let conf = config("[DEFAULT]\ntest_command=run\n");
        let mut source = InstanceSource::new(&connector, &ui, &conf, 2);
        assert!(source.obtain_instance("DEFAULT").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn provision_loops_until_pool_reaches_concurrency() {
        let connector = ShellConnector::new();
        let ui = MemoryUi::new();
        // Yields one instance per callout, so reaching a concurrency of
        // two takes two rounds.
        let conf = config(
            "[DEFAULT]\ntest_command=run\n\
             instance_provision=echo $PROFILE-$INSTANCE_COUNT\n",
        );
        let mut source = InstanceSource::new(&connector, &ui, &conf, 2);
        let first = source.obtain_instance("py3").await.unwrap().unwrap();
        assert_eq!(first.profile(), "py3");
        let second = source.obtain_instance("py3").await.unwrap().unwrap();
        assert_ne!(first.id(), second.id());
        // Two provisioning rounds were echoed to the user.
        let rounds = ui
            .values
            .lock()
            .unwrap()
            .iter()
            .filter(|(label, _)| label == "running")
            .count();
        assert_eq!(rounds, 2);
    }

    #[tokio::test]
    async fn failed_provision_is_fatal() {
        let connector = ShellConnector::new();
        let ui = MemoryUi::new();
        let conf = config("[DEFAULT]\ntest_command=run\ninstance_provision=exit 7\n");
        let mut source = InstanceSource::new(&connector, &ui, &conf, 1);
        let err = source.obtain_instance("py3").await.unwrap_err();
        assert!(matches!(err, QuarryError::ProvisionFailed { code: 7, .. }));
    }

    #[tokio::test]
    async fn empty_provision_output_is_fatal() {
        let connector = ShellConnector::new();
        let ui = MemoryUi::new();
        let conf = config("[DEFAULT]\ntest_command=run\ninstance_provision=true\n");
        let mut source = InstanceSource::new(&connector, &ui, &conf, 1);
        let err = source.obtain_instance("py3").await.unwrap_err();
        assert!(matches!(err, QuarryError::ProvisionFailed { .. }));
    }

    #[tokio::test]
    async fn dispose_runs_with_sorted_ids() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("disposed");
        let connector = ShellConnector::new();
        let ui = MemoryUi::new();
        let text = format!(
            "[DEFAULT]\ntest_command=run\n\
             instance_provision=echo b a\n\
             instance_dispose=echo $INSTANCE_IDS > {}\n",
            marker.display()
        );
        let conf = config(&text);
        let mut source = InstanceSource::new(&connector, &ui, &conf, 2);
        let held = source.obtain_instance("py3").await.unwrap().unwrap();
        source.release_instance(&held).unwrap();
        source.dispose_all().await.unwrap();
        let recorded = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(recorded.trim(), "a b");
        // Pool is cleared: the next obtain provisions afresh.
        assert!(source.obtain_instance("py3").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn failed_dispose_is_fatal_but_clears_pool() {
        let connector = ShellConnector::new();
        let ui = MemoryUi::new();
        let conf = config(
            "[DEFAULT]\ntest_command=run\ninstance_provision=echo one\ninstance_dispose=exit 9\n",
        );
        let mut source = InstanceSource::new(&connector, &ui, &conf, 1);
        source.obtain_instance("py3").await.unwrap();
        let err = source.dispose_all().await.unwrap_err();
        assert!(matches!(err, QuarryError::DisposeFailed { code: 9, .. }));
    }
}
