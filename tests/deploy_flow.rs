use keypair_manager::core::credstore::{FileKeypairApi, FileSecretStore};
use keypair_manager::core::factory::CredentialFactory;
use keypair_manager::core::function_host::LocalFunctionHost;
use keypair_manager::core::graph::ApplyOptions;
use keypair_manager::core::naming::FixedSuffix;
use keypair_manager::core::provider::{KeypairApi, ProviderError, SecretStore};
use keypair_manager::core::state::StateStore;
use keypair_manager::error::{DeployError, ProvisioningError};
use keypair_manager::models::credential::Material;
use keypair_manager::models::deploy_config::DeployFile;
use keypair_manager::models::invocation::{Action, InvocationStatus};
use keypair_manager::models::policy::RolePolicy;
use keypair_manager::units::{self, DeployEnv, KEYPAIR, MANAGER, NETWORK, SYSTEMS};
use serde_json::json;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const FUNCTION: &str = "ec2-keypair-init";

/// File-backed keypair API that counts calls and can be slowed down.
struct Tracked {
    inner: FileKeypairApi,
    delay: Duration,
    calls: AtomicUsize,
}

impl Tracked {
    fn new(dir: &Path, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: FileKeypairApi::new(dir.join("keypairs")),
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl KeypairApi for Tracked {
    fn create_key_pair(&self, name: &str) -> Result<Material, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.delay);
        self.inner.create_key_pair(name)
    }

    fn key_pair_exists(&self, name: &str) -> Result<bool, ProviderError> {
        self.inner.key_pair_exists(name)
    }
}

/// Accepts every location and refuses every write.
struct RefusingSecrets;

impl SecretStore for RefusingSecrets {
    fn check_location(&self, _location: &str) -> Result<(), ProviderError> {
        Ok(())
    }

    fn put_secret(&self, _location: &str, _material: &Material) -> Result<(), ProviderError> {
        Err(ProviderError::unavailable("throttled"))
    }

    fn secret_exists(&self, _location: &str) -> Result<bool, ProviderError> {
        Ok(false)
    }
}

/// Secret store whose writes hang until the test releases them, standing in
/// for a process that dies mid-invocation.
struct Hanging {
    inner: FileSecretStore,
    after_write: bool,
    gate: Mutex<mpsc::Receiver<()>>,
}

impl Hanging {
    fn new(dir: &Path, after_write: bool) -> (Arc<Self>, mpsc::Sender<()>) {
        let (release, gate) = mpsc::channel();
        let store = Arc::new(Self {
            inner: FileSecretStore::new(dir.join("secrets")),
            after_write,
            gate: Mutex::new(gate),
        });
        (store, release)
    }

    fn hang(&self) {
        let _ = self.gate.lock().unwrap().recv();
    }
}

impl SecretStore for Hanging {
    fn check_location(&self, location: &str) -> Result<(), ProviderError> {
        self.inner.check_location(location)
    }

    fn put_secret(&self, location: &str, material: &Material) -> Result<(), ProviderError> {
        if !self.after_write {
            self.hang();
        }
        self.inner.put_secret(location, material)?;
        if self.after_write {
            self.hang();
        }
        Ok(())
    }

    fn secret_exists(&self, location: &str) -> Result<bool, ProviderError> {
        self.inner.secret_exists(location)
    }
}

fn wait_for(mut ready: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !ready() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    assert!(ready());
}

fn host(keypairs: Arc<dyn KeypairApi>, secrets: Arc<dyn SecretStore>, ledger: Option<&Path>) -> LocalFunctionHost {
    let factory = CredentialFactory::new(keypairs, secrets, RolePolicy::allow_all("factory"));
    let mut host = LocalFunctionHost::new(RolePolicy::allow_all("deployer"));
    host.register(FUNCTION, Arc::new(factory), ledger.map(Path::to_path_buf))
        .unwrap();
    host
}

fn file_secrets(dir: &Path) -> Arc<dyn SecretStore> {
    Arc::new(FileSecretStore::new(dir.join("secrets")))
}

fn single_attempt() -> ApplyOptions {
    ApplyOptions {
        only: Vec::new(),
        max_attempts: 1,
    }
}

#[test]
fn test_full_apply_publishes_identifiers_only() {
    let dir = TempDir::new().unwrap();
    let keypairs = Tracked::new(dir.path(), Duration::ZERO);
    let host = host(keypairs.clone(), file_secrets(dir.path()), None);
    let mut env = DeployEnv::new(
        DeployFile::default(),
        StateStore::in_memory(),
        &host,
        Box::new(FixedSuffix("ab12cd".into())),
        Duration::from_secs(10),
    );
    let mut graph = units::standard_graph().unwrap();

    let report = graph.apply(&mut env, &single_attempt(), &mut |_| true).unwrap();

    assert_eq!(report.applied, vec![NETWORK, KEYPAIR, SYSTEMS, MANAGER]);
    assert_eq!(report.props.get("keypair_name"), Some(&json!("keypair-ab12cd")));
    assert_eq!(
        report.props.get("keypair_secret_name"),
        Some(&json!("ec2-ssh-key/keypair-ab12cd/private"))
    );
    let keypair_keys: Vec<&str> = report.props.keys_of(KEYPAIR).collect();
    assert_eq!(keypair_keys, vec!["keypair_name", "keypair_secret_name"]);
    for (_, published) in report.props.iter() {
        assert!(!published.value.to_string().contains("PRIVATE KEY"));
    }
    assert_eq!(keypairs.calls(), 1);

    let secret = dir.path().join("secrets/ec2-ssh-key/keypair-ab12cd/private");
    let pem = std::fs::read_to_string(&secret).unwrap();
    assert!(pem.contains("BEGIN PRIVATE KEY"));
    let mode = std::fs::metadata(&secret).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o600);

    let history = env.invoker.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].physical_resource_id, "keypair-ec2-keypair-init");
    assert_eq!(history[0].status, InvocationStatus::Succeeded);
}

#[test]
fn test_second_run_reaffirms_without_new_keypair() {
    let dir = TempDir::new().unwrap();
    let keypairs = Tracked::new(dir.path(), Duration::ZERO);
    let host = host(keypairs.clone(), file_secrets(dir.path()), None);
    let state_path = dir.path().join("state.json");

    let mut first = DeployEnv::new(
        DeployFile::default(),
        StateStore::load(&state_path).unwrap(),
        &host,
        Box::new(FixedSuffix("ab12cd".into())),
        Duration::from_secs(10),
    );
    units::standard_graph()
        .unwrap()
        .apply(&mut first, &single_attempt(), &mut |_| true)
        .unwrap();

    let mut second = DeployEnv::new(
        DeployFile::default(),
        StateStore::load(&state_path).unwrap(),
        &host,
        Box::new(FixedSuffix("zz9999".into())),
        Duration::from_secs(10),
    );
    let report = units::standard_graph()
        .unwrap()
        .apply(&mut second, &single_attempt(), &mut |_| true)
        .unwrap();

    assert_eq!(report.props.get("keypair_name"), Some(&json!("keypair-ab12cd")));
    assert_eq!(keypairs.calls(), 1);
    let history = second.invoker.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].action, Action::Update);
    assert!(history[0].deduplicated);
}

#[test]
fn test_timed_out_invocation_completes_once_on_retry() {
    let dir = TempDir::new().unwrap();
    let keypairs = Tracked::new(dir.path(), Duration::from_millis(300));
    let ledger = dir.path().join("ledger.json");
    let host = host(keypairs.clone(), file_secrets(dir.path()), Some(&ledger));

    let mut first = DeployEnv::new(
        DeployFile::default(),
        StateStore::in_memory(),
        &host,
        Box::new(FixedSuffix("ab12cd".into())),
        Duration::from_millis(50),
    );
    let failure = units::standard_graph()
        .unwrap()
        .apply(&mut first, &single_attempt(), &mut |_| true)
        .unwrap_err();
    assert_eq!(failure.unit.as_deref(), Some(KEYPAIR));
    assert_eq!(failure.error.kind(), "TimeoutError");
    assert!(failure.error.is_retryable());
    assert_eq!(failure.not_attempted, vec![SYSTEMS, MANAGER]);

    let id = "keypair-ec2-keypair-init";
    let record = first.state.invocation(id).unwrap();
    assert_eq!(record.status, InvocationStatus::Failed);
    assert_eq!(record.error_kind.as_deref(), Some("TimeoutError"));

    let deadline = Instant::now() + Duration::from_secs(5);
    while host.recorded_ids(FUNCTION).is_empty() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(host.recorded_ids(FUNCTION), vec![id.to_string()]);

    let mut second = DeployEnv::new(
        DeployFile::default(),
        first.state,
        &host,
        Box::new(FixedSuffix("ffffff".into())),
        Duration::from_secs(5),
    );
    let report = units::standard_graph()
        .unwrap()
        .apply(&mut second, &single_attempt(), &mut |_| true)
        .unwrap();

    assert_eq!(report.props.get("keypair_name"), Some(&json!("keypair-ab12cd")));
    assert_eq!(keypairs.calls(), 1);
    let retry = &second.invoker.history()[0];
    assert_eq!(retry.physical_resource_id, id);
    assert_eq!(retry.action, Action::Create);
    assert!(retry.deduplicated);
    let record = second.state.invocation(id).unwrap();
    assert_eq!(record.status, InvocationStatus::Succeeded);
    assert_eq!(record.attempts, 2);
}

#[test]
fn test_failed_keypair_unit_stops_dependents() {
    let dir = TempDir::new().unwrap();
    let keypairs = Tracked::new(dir.path(), Duration::ZERO);
    keypairs.inner.create_key_pair("keypair-ab12cd").unwrap();
    let host = host(keypairs.clone(), file_secrets(dir.path()), None);
    let mut env = DeployEnv::new(
        DeployFile::default(),
        StateStore::in_memory(),
        &host,
        Box::new(FixedSuffix("ab12cd".into())),
        Duration::from_secs(10),
    );
    let opts = ApplyOptions {
        only: Vec::new(),
        max_attempts: 3,
    };

    let failure = units::standard_graph()
        .unwrap()
        .apply(&mut env, &opts, &mut |_| true)
        .unwrap_err();

    assert_eq!(failure.unit.as_deref(), Some(KEYPAIR));
    assert_eq!(failure.error.kind(), "NameCollisionError");
    assert_eq!(failure.attempts, 1);
    assert_eq!(failure.applied, vec![NETWORK]);
    assert_eq!(failure.not_attempted, vec![SYSTEMS, MANAGER]);
    assert!(!failure.props.contains_key("asg_name"));
    assert!(!failure.props.contains_key("keypair_name"));
    assert!(!dir.path().join("secrets/ec2-ssh-key/keypair-ab12cd/private").exists());
}

#[test]
fn test_secret_write_failure_reports_partial_provisioning() {
    let dir = TempDir::new().unwrap();
    let keypairs = Tracked::new(dir.path(), Duration::ZERO);
    let host = host(keypairs.clone(), Arc::new(RefusingSecrets), None);
    let mut env = DeployEnv::new(
        DeployFile::default(),
        StateStore::in_memory(),
        &host,
        Box::new(FixedSuffix("ab12cd".into())),
        Duration::from_secs(10),
    );
    let opts = ApplyOptions {
        only: Vec::new(),
        max_attempts: 3,
    };

    let failure = units::standard_graph()
        .unwrap()
        .apply(&mut env, &opts, &mut |_| true)
        .unwrap_err();

    assert_eq!(failure.attempts, 1);
    match &failure.error {
        DeployError::Provisioning(ProvisioningError::PartialProvisioning {
            keypair_name,
            missing_secret,
            ..
        }) => {
            assert_eq!(keypair_name, "keypair-ab12cd");
            assert_eq!(missing_secret, "ec2-ssh-key/keypair-ab12cd/private");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(keypairs.key_pair_exists("keypair-ab12cd").unwrap());
    assert!(!failure.error.to_string().contains("PRIVATE KEY"));
}

#[test]
fn test_unit_filter_applies_dependency_closure() {
    let dir = TempDir::new().unwrap();
    let keypairs = Tracked::new(dir.path(), Duration::ZERO);
    let host = host(keypairs.clone(), file_secrets(dir.path()), None);
    let mut env = DeployEnv::new(
        DeployFile::default(),
        StateStore::in_memory(),
        &host,
        Box::new(FixedSuffix("ab12cd".into())),
        Duration::from_secs(10),
    );
    let opts = ApplyOptions {
        only: vec![KEYPAIR.to_string()],
        max_attempts: 1,
    };

    let report = units::standard_graph()
        .unwrap()
        .apply(&mut env, &opts, &mut |_| true)
        .unwrap();

    assert_eq!(report.applied, vec![NETWORK, KEYPAIR]);
    assert_eq!(report.excluded, vec![SYSTEMS, MANAGER]);
    assert!(env.state.stack(SYSTEMS).is_none());
}

#[test]
fn test_operator_stop_leaves_later_units_untouched() {
    let dir = TempDir::new().unwrap();
    let keypairs = Tracked::new(dir.path(), Duration::ZERO);
    let host = host(keypairs.clone(), file_secrets(dir.path()), None);
    let mut env = DeployEnv::new(
        DeployFile::default(),
        StateStore::in_memory(),
        &host,
        Box::new(FixedSuffix("ab12cd".into())),
        Duration::from_secs(10),
    );

    let report = units::standard_graph()
        .unwrap()
        .apply(&mut env, &single_attempt(), &mut |unit| unit != KEYPAIR)
        .unwrap();

    assert_eq!(report.aborted_before.as_deref(), Some(KEYPAIR));
    assert_eq!(report.applied, vec![NETWORK]);
    assert_eq!(keypairs.calls(), 0);
    assert!(env.invoker.history().is_empty());
}

#[test]
fn test_interrupted_invocation_completes_on_next_run() {
    let dir = TempDir::new().unwrap();
    let ledger = dir.path().join("ledger.json");
    let state_path = dir.path().join("state.json");
    let secret = dir.path().join("secrets/ec2-ssh-key/keypair-ab12cd/private");

    let (hanging, release) = Hanging::new(dir.path(), true);
    let first_host = host(Tracked::new(dir.path(), Duration::ZERO), hanging, Some(&ledger));
    let mut first = DeployEnv::new(
        DeployFile::default(),
        StateStore::load(&state_path).unwrap(),
        &first_host,
        Box::new(FixedSuffix("ab12cd".into())),
        Duration::from_millis(100),
    );
    let failure = units::standard_graph()
        .unwrap()
        .apply(&mut first, &single_attempt(), &mut |_| true)
        .unwrap_err();
    assert_eq!(failure.error.kind(), "TimeoutError");
    wait_for(|| secret.exists());

    let keypairs = Tracked::new(dir.path(), Duration::ZERO);
    let second_host = host(keypairs.clone(), file_secrets(dir.path()), Some(&ledger));
    let mut second = DeployEnv::new(
        DeployFile::default(),
        StateStore::load(&state_path).unwrap(),
        &second_host,
        Box::new(FixedSuffix("ffffff".into())),
        Duration::from_secs(5),
    );
    let report = units::standard_graph()
        .unwrap()
        .apply(&mut second, &single_attempt(), &mut |_| true)
        .unwrap();

    assert_eq!(report.props.get("keypair_name"), Some(&json!("keypair-ab12cd")));
    assert_eq!(report.applied, vec![NETWORK, KEYPAIR, SYSTEMS, MANAGER]);
    assert_eq!(keypairs.calls(), 0);
    let retry = &second.invoker.history()[0];
    assert!(retry.deduplicated);
    let record = second.state.invocation("keypair-ec2-keypair-init").unwrap();
    assert_eq!(record.status, InvocationStatus::Succeeded);
    assert_eq!(record.attempts, 2);
    drop(release);
}

#[test]
fn test_interrupted_before_secret_reports_partial_on_next_run() {
    let dir = TempDir::new().unwrap();
    let ledger = dir.path().join("ledger.json");
    let state_path = dir.path().join("state.json");

    let (hanging, release) = Hanging::new(dir.path(), false);
    let first_keypairs = Tracked::new(dir.path(), Duration::ZERO);
    let first_host = host(first_keypairs.clone(), hanging, Some(&ledger));
    let mut first = DeployEnv::new(
        DeployFile::default(),
        StateStore::load(&state_path).unwrap(),
        &first_host,
        Box::new(FixedSuffix("ab12cd".into())),
        Duration::from_millis(100),
    );
    units::standard_graph()
        .unwrap()
        .apply(&mut first, &single_attempt(), &mut |_| true)
        .unwrap_err();
    wait_for(|| first_keypairs.key_pair_exists("keypair-ab12cd").unwrap());

    let keypairs = Tracked::new(dir.path(), Duration::ZERO);
    let second_host = host(keypairs.clone(), file_secrets(dir.path()), Some(&ledger));
    let mut second = DeployEnv::new(
        DeployFile::default(),
        StateStore::load(&state_path).unwrap(),
        &second_host,
        Box::new(FixedSuffix("ffffff".into())),
        Duration::from_secs(5),
    );
    let failure = units::standard_graph()
        .unwrap()
        .apply(&mut second, &single_attempt(), &mut |_| true)
        .unwrap_err();

    match &failure.error {
        DeployError::Provisioning(ProvisioningError::PartialProvisioning {
            keypair_name,
            missing_secret,
            ..
        }) => {
            assert_eq!(keypair_name, "keypair-ab12cd");
            assert_eq!(missing_secret, "ec2-ssh-key/keypair-ab12cd/private");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let again = units::standard_graph()
        .unwrap()
        .apply(&mut second, &single_attempt(), &mut |_| true)
        .unwrap_err();
    assert_eq!(again.error.kind(), "PartialProvisioningError");
    assert_eq!(keypairs.calls(), 0);
    drop(release);
}
