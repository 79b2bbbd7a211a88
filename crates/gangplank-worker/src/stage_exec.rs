//! Stage script rendering and execution: prep -> main -> post, each phase
//! invoked under `/bin/bash -xeu -o pipefail`.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use gangplank_config::TemplateContext;
use gangplank_core::Stage;
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::{Result, WorkerError};

const MAIN_LAUNCH_STAGGER: Duration = Duration::from_millis(50);

/// Render a stage's three command lists and run them in order. Prep must
/// succeed to enter main. Main runs serially (first failure aborts) or
/// concurrently (all launched with a stagger, all joined, first error
/// wins) depending on `concurrent_execution`. Post always runs serially;
/// if `post_always` it runs even when main failed.
pub async fn run_stage(
    stage: &Stage,
    ctx: &TemplateContext,
    env: &HashMap<String, String>,
    scripts_dir: &Path,
    work_dir: &Path,
) -> Result<()> {
    tokio::fs::create_dir_all(scripts_dir).await?;

    run_phase_serial(stage, "prep", &ctx.render_all(&stage.prep_commands), env, scripts_dir, work_dir).await?;

    let main_rendered = ctx.render_all(&stage.commands);
    let main_result = if stage.concurrent_execution {
        run_phase_concurrent(stage, &main_rendered, env, scripts_dir, work_dir).await
    } else {
        run_phase_serial(stage, "main", &main_rendered, env, scripts_dir, work_dir).await
    };

    let post_rendered = ctx.render_all(&stage.post_commands);
    if stage.post_always {
        let post_result = run_phase_serial(stage, "post", &post_rendered, env, scripts_dir, work_dir).await;
        main_result?;
        post_result
    } else {
        main_result?;
        run_phase_serial(stage, "post", &post_rendered, env, scripts_dir, work_dir).await
    }
}

async fn run_phase_serial(
    stage: &Stage,
    phase: &'static str,
    commands: &[String],
    env: &HashMap<String, String>,
    scripts_dir: &Path,
    work_dir: &Path,
) -> Result<()> {
    if commands.is_empty() {
        return Ok(());
    }
    let script_path = write_script(scripts_dir, phase, commands).await?;
    run_script(stage, phase, &script_path, env, work_dir).await
}

async fn run_phase_concurrent(
    stage: &Stage,
    commands: &[String],
    env: &HashMap<String, String>,
    scripts_dir: &Path,
    work_dir: &Path,
) -> Result<()> {
    if commands.is_empty() {
        return Ok(());
    }

    let mut handles = Vec::with_capacity(commands.len());
    for (idx, command) in commands.iter().enumerate() {
        let script_path = write_script(scripts_dir, "main", std::slice::from_ref(command)).await?;
        let script_path = rename_for_index(&script_path, idx).await?;
        let stage_id = stage.id.clone();
        let env = env.clone();
        let work_dir = work_dir.to_path_buf();

        handles.push(tokio::spawn(async move {
            run_script_owned(stage_id, "main", script_path, env, work_dir).await
        }));
        tokio::time::sleep(MAIN_LAUNCH_STAGGER).await;
    }

    let mut first_error = None;
    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
            Err(join_err) => {
                if first_error.is_none() {
                    first_error = Some(WorkerError::Internal(format!("main command task panicked: {join_err}")));
                }
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn rename_for_index(path: &Path, idx: usize) -> Result<std::path::PathBuf> {
    let renamed = path.with_file_name(format!("main-{idx}.sh"));
    tokio::fs::rename(path, &renamed).await?;
    Ok(renamed)
}

async fn write_script(dir: &Path, phase: &str, commands: &[String]) -> Result<std::path::PathBuf> {
    let path = dir.join(format!("{phase}.sh"));
    let mut body = String::from("#!/bin/bash\nset -xeu -o pipefail\n");
    for line in commands {
        body.push_str(line);
        body.push('\n');
    }
    tokio::fs::write(&path, body).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = tokio::fs::metadata(&path).await?.permissions();
        perms.set_mode(0o755);
        tokio::fs::set_permissions(&path, perms).await?;
    }

    Ok(path)
}

async fn run_script(
    stage: &Stage,
    phase: &'static str,
    script_path: &Path,
    env: &HashMap<String, String>,
    work_dir: &Path,
) -> Result<()> {
    run_script_owned(stage.id.clone(), phase, script_path.to_path_buf(), env.clone(), work_dir.to_path_buf()).await
}

async fn run_script_owned(
    stage_id: gangplank_core::StageId,
    phase: &'static str,
    script_path: std::path::PathBuf,
    env: HashMap<String, String>,
    work_dir: std::path::PathBuf,
) -> Result<()> {
    info!(stage = %stage_id, phase, script = %script_path.display(), "running stage phase");

    let status = Command::new("/bin/bash")
        .arg(&script_path)
        .current_dir(&work_dir)
        .envs(env)
        .stdin(Stdio::null())
        .status()
        .await?;

    if status.success() {
        Ok(())
    } else {
        warn!(stage = %stage_id, phase, ?status, "stage phase failed");
        Err(WorkerError::CommandFailed {
            stage: stage_id.to_string(),
            phase,
            detail: format!("{status:?}"),
        })
    }
}
