use std::collections::HashSet;
use std::env;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

pub const STATE_DIR_NAME: &str = ".wnpp";
pub const DB_FILENAME: &str = "wnpp.db";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Heuristic,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Heuristic => "heuristic",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub project_root: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
    pub executable_dir: Option<PathBuf>,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        let executable_dir = env::current_exe()
            .ok()
            .and_then(|path| path.parent().map(Path::to_path_buf));
        Ok(Self {
            cwd,
            executable_dir,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub state_dir: PathBuf,
    pub data_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub static_dir: PathBuf,
    pub db_path: PathBuf,
    pub config_path: PathBuf,
    pub root_source: ValueSource,
    pub data_source: ValueSource,
    pub config_source: ValueSource,
}

#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub project_root_exists: bool,
    pub state_dir_exists: bool,
    pub data_dir_exists: bool,
    pub static_dir_exists: bool,
    pub db_exists: bool,
    pub db_size_bytes: Option<u64>,
    pub config_exists: bool,
    pub warnings: Vec<String>,
}

impl ResolvedPaths {
    pub fn diagnostics(&self) -> String {
        format!(
            "project_root={} ({})\nstate_dir={}\ndata_dir={} ({})\ncache_dir={}\nstatic_dir={}\ndb_path={}\nconfig_path={} ({})",
            normalize_for_display(&self.project_root),
            self.root_source.as_str(),
            normalize_for_display(&self.state_dir),
            normalize_for_display(&self.data_dir),
            self.data_source.as_str(),
            normalize_for_display(&self.cache_dir),
            normalize_for_display(&self.static_dir),
            normalize_for_display(&self.db_path),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
        )
    }

    /// Layout rooted at `project_root` with every path at its default location.
    pub fn for_project_root(project_root: &Path) -> Self {
        let state_dir = project_root.join(STATE_DIR_NAME);
        let data_dir = state_dir.join("data");
        Self {
            project_root: project_root.to_path_buf(),
            cache_dir: state_dir.join("cache"),
            static_dir: project_root.join("static"),
            db_path: data_dir.join(DB_FILENAME),
            config_path: state_dir.join("config.toml"),
            state_dir,
            data_dir,
            root_source: ValueSource::Flag,
            data_source: ValueSource::Default,
            config_source: ValueSource::Default,
        }
    }
}

pub fn inspect_runtime(paths: &ResolvedPaths) -> Result<RuntimeStatus> {
    let db_size_bytes = match fs::metadata(&paths.db_path) {
        Ok(metadata) => Some(metadata.len()),
        Err(error) if error.kind() == ErrorKind::NotFound => None,
        Err(error) => {
            return Err(error)
                .with_context(|| format!("failed to inspect {}", paths.db_path.display()));
        }
    };
    let state_dir_exists = paths.state_dir.is_dir();
    let static_dir_exists = paths.static_dir.is_dir();

    let warnings = [
        (!state_dir_exists, ".wnpp/ is missing; run `wnpp init` first"),
        (db_size_bytes.is_none(), "database is missing; run `wnpp db migrate`"),
        (!static_dir_exists, "static/ is missing; favicons and stylesheets will 404"),
    ]
    .into_iter()
    .filter_map(|(applies, warning)| applies.then(|| warning.to_string()))
    .collect();

    Ok(RuntimeStatus {
        project_root_exists: paths.project_root.is_dir(),
        state_dir_exists,
        data_dir_exists: paths.data_dir.is_dir(),
        static_dir_exists,
        db_exists: db_size_bytes.is_some(),
        db_size_bytes,
        config_exists: paths.config_path.is_file(),
        warnings,
    })
}

pub fn ensure_database_ready(paths: &ResolvedPaths, status: &RuntimeStatus) -> Result<()> {
    if !status.db_exists {
        bail!(
            "Database {} does not exist.\nRun: wnpp init --project-root {} && wnpp db migrate",
            normalize_for_display(&paths.db_path),
            normalize_for_display(&paths.project_root)
        );
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct InitOptions {
    pub materialize_config: bool,
    pub force: bool,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            materialize_config: true,
            force: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InitReport {
    pub created_dirs: Vec<PathBuf>,
    pub wrote_config: bool,
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let (project_root, root_source) = resolve_project_root(context, overrides, &lookup_env)
        .context("failed to resolve project root")?;
    let defaults = ResolvedPaths::for_project_root(&project_root);

    let (data_dir, data_source) = pick_path(
        overrides.data_dir.as_deref(),
        lookup_env("WNPP_DATA_DIR"),
        &project_root,
    )
    .unwrap_or_else(|| (defaults.data_dir.clone(), ValueSource::Default));
    let (config_path, config_source) = pick_path(
        overrides.config.as_deref(),
        lookup_env("WNPP_CONFIG"),
        &project_root,
    )
    .unwrap_or_else(|| (defaults.config_path.clone(), ValueSource::Default));

    Ok(ResolvedPaths {
        db_path: data_dir.join(DB_FILENAME),
        data_dir,
        config_path,
        root_source,
        data_source,
        config_source,
        ..defaults
    })
}

/// Flag beats a non-blank env value; relative paths hang off `base`.
fn pick_path(
    flag: Option<&Path>,
    env_value: Option<String>,
    base: &Path,
) -> Option<(PathBuf, ValueSource)> {
    if let Some(path) = flag {
        return Some((absolutize(path, base), ValueSource::Flag));
    }
    env_value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(|value| (absolutize(Path::new(&value), base), ValueSource::Env))
}

pub fn init_layout(paths: &ResolvedPaths, options: &InitOptions) -> Result<InitReport> {
    let mut created_dirs = Vec::new();

    let required_dirs = [
        paths.state_dir.clone(),
        paths.data_dir.clone(),
        paths.cache_dir.clone(),
        paths.static_dir.clone(),
        paths.static_dir.join("favicon"),
        paths.static_dir.join("well-known"),
    ];
    for dir in &required_dirs {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            created_dirs.push(dir.clone());
        }
    }

    let wrote_config = if options.materialize_config {
        write_text_file(
            &paths.config_path,
            &render_materialized_config(paths),
            options.force,
        )?
    } else {
        false
    };

    Ok(InitReport {
        created_dirs,
        wrote_config,
    })
}

pub fn render_materialized_config(paths: &ResolvedPaths) -> String {
    let static_dir = normalize_for_display(&paths.static_dir);

    format!(
        "# wnpp runtime configuration (materialized by `wnpp init`)\n\n[debbugs]\n# soap_url = \"https://bugs.debian.org/cgi-bin/soap.cgi\"\n# user_agent = \"wnpp/0.3\"\nbatch_size = 100\nstale_hours = 2\n\n[popcon]\n# binary_url = \"https://popcon.debian.org/by_inst.gz\"\n# source_url = \"https://popcon.debian.org/source/by_inst.gz\"\nstale_hours = 12\n\n[server]\nbind = \"127.0.0.1:8000\"\nstatic_dir = \"{static_dir}\"\n\n[listing]\nper_page = 50\nmax_item_count = 11\nending_item_count = 2\n",
    )
}

fn resolve_project_root<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: &F,
) -> Result<(PathBuf, ValueSource)>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = overrides.project_root.as_deref() {
        return Ok((absolutize(path, &context.cwd), ValueSource::Flag));
    }

    if let Some(value) = lookup_env("WNPP_PROJECT_ROOT") {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            bail!("WNPP_PROJECT_ROOT is set but empty");
        }
        return Ok((absolutize(Path::new(trimmed), &context.cwd), ValueSource::Env));
    }

    Ok(detect_project_root_heuristic(
        &context.cwd,
        context.executable_dir.as_deref(),
    ))
}

fn detect_project_root_heuristic(cwd: &Path, executable_dir: Option<&Path>) -> (PathBuf, ValueSource) {
    let mut seen = HashSet::new();
    let mut candidates: Vec<&Path> = cwd.ancestors().collect();
    if let Some(exe_dir) = executable_dir {
        candidates.extend(exe_dir.ancestors());
    }
    for candidate in candidates {
        if !seen.insert(candidate.to_path_buf()) {
            continue;
        }
        if candidate.join(STATE_DIR_NAME).is_dir() {
            return (candidate.to_path_buf(), ValueSource::Heuristic);
        }
    }
    (cwd.to_path_buf(), ValueSource::Default)
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Writes `content` unless the file exists and `force` is off; reports whether it wrote.
fn write_text_file(path: &Path, content: &str, force: bool) -> Result<bool> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let mut options = OpenOptions::new();
    options.write(true);
    if force {
        options.create(true).truncate(true);
    } else {
        options.create_new(true);
    }
    let mut file = match options.open(path) {
        Ok(file) => file,
        Err(error) if !force && error.kind() == ErrorKind::AlreadyExists => return Ok(false),
        Err(error) => {
            return Err(error).with_context(|| format!("failed to open {}", path.display()));
        }
    };
    file.write_all(content.as_bytes())
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    fn context_at(cwd: &Path) -> ResolutionContext {
        ResolutionContext {
            cwd: cwd.to_path_buf(),
            executable_dir: None,
        }
    }

    fn rooted_at(root: &Path) -> PathOverrides {
        PathOverrides {
            project_root: Some(root.to_path_buf()),
            ..PathOverrides::default()
        }
    }

    #[test]
    fn flag_root_wins_over_env_root() {
        let temp = tempdir().expect("tempdir");
        let flag_root = temp.path().join("flag-root");
        let env = HashMap::from([(
            "WNPP_PROJECT_ROOT",
            temp.path().join("env-root").to_string_lossy().to_string(),
        )]);

        let resolved = resolve_paths_with_lookup(&context_at(temp.path()), &rooted_at(&flag_root), |key| {
            env.get(key).cloned()
        })
        .expect("resolve");
        assert_eq!(resolved.project_root, flag_root);
        assert_eq!(resolved.root_source, ValueSource::Flag);
    }

    #[test]
    fn env_data_dir_and_config_are_relative_to_the_project() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        let env = HashMap::from([
            ("WNPP_DATA_DIR", "var/db".to_string()),
            ("WNPP_CONFIG", "   ".to_string()),
        ]);

        let resolved = resolve_paths_with_lookup(&context_at(&root), &rooted_at(&root), |key| {
            env.get(key).cloned()
        })
        .expect("resolve");
        assert_eq!(resolved.db_path, root.join("var/db").join(DB_FILENAME));
        assert_eq!(resolved.data_source, ValueSource::Env);
        assert_eq!(resolved.config_path, root.join(".wnpp/config.toml"));
        assert_eq!(resolved.config_source, ValueSource::Default);
    }

    #[test]
    fn blank_env_root_is_an_error() {
        let temp = tempdir().expect("tempdir");
        let env = HashMap::from([("WNPP_PROJECT_ROOT", " ".to_string())]);
        let error = resolve_paths_with_lookup(&context_at(temp.path()), &PathOverrides::default(), |key| {
            env.get(key).cloned()
        })
        .expect_err("blank root");
        assert!(format!("{error:#}").contains("set but empty"));
    }

    #[test]
    fn nearest_ancestor_with_state_dir_is_the_root() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        let nested = root.join("a").join("b");
        fs::create_dir_all(root.join(STATE_DIR_NAME)).expect("state dir");
        fs::create_dir_all(&nested).expect("nested");

        let resolved = resolve_paths_with_lookup(&context_at(&nested), &PathOverrides::default(), |_| None)
            .expect("resolve");
        assert_eq!(resolved.project_root, root);
        assert_eq!(resolved.root_source, ValueSource::Heuristic);
    }

    #[test]
    fn init_is_idempotent_and_keeps_existing_config() {
        let temp = tempdir().expect("tempdir");
        let paths = ResolvedPaths::for_project_root(&temp.path().join("project"));

        let report = init_layout(&paths, &InitOptions::default()).expect("init");
        assert!(report.wrote_config);
        for dir in [&paths.data_dir, &paths.cache_dir, &paths.static_dir.join("favicon")] {
            assert!(dir.is_dir(), "{}", dir.display());
        }
        let config = fs::read_to_string(&paths.config_path).expect("config");
        assert!(config.contains("[listing]\nper_page = 50"));

        fs::write(&paths.config_path, "# mine\n").expect("edit config");
        let again = init_layout(&paths, &InitOptions::default()).expect("init again");
        assert!(again.created_dirs.is_empty());
        assert!(!again.wrote_config);
        assert_eq!(fs::read_to_string(&paths.config_path).expect("config"), "# mine\n");

        let forced = init_layout(
            &paths,
            &InitOptions {
                force: true,
                ..InitOptions::default()
            },
        )
        .expect("forced init");
        assert!(forced.wrote_config);
    }

    #[test]
    fn missing_database_is_reported() {
        let temp = tempdir().expect("tempdir");
        let paths = ResolvedPaths::for_project_root(temp.path());
        let status = inspect_runtime(&paths).expect("inspect");
        assert!(!status.db_exists);
        assert!(status.warnings.iter().any(|warning| warning.contains("wnpp db migrate")));
        let error = ensure_database_ready(&paths, &status).expect_err("must fail");
        assert!(error.to_string().contains("does not exist"));
    }
}
