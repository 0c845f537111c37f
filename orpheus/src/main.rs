mod args;
mod logging;
mod ui;

use anyhow::{Context, Result, bail};
use args::Command;
use orpheus::config::{self, Config};
use orpheus::feed::{self, FollowEnd};
use orpheus::http::{AvatarHttpSource, SlidesHttpSource};
use orpheus::polling::{self, PollSources};
use orpheus::projector::{DisplayState, project};
use orpheus::reconciler::Reconciler;
use orpheus::submit::CoreClient;
use orpheus::JobId;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use ui::StatusBoard;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = args::get_cli_args();

    if let Command::Config = cli.command {
        let path = config::config_path()?;
        config::write_default(&path)?;
        println!("已重置配置文件: {}", path.display());
        return Ok(());
    }

    let Some(cfg) = config::load_or_create_config()? else {
        println!(
            "已创建默认配置文件 {}，请修改后重新运行",
            config::config_path()?.display()
        );
        return Ok(());
    };

    let _guard = logging::init_logging(cli.verbose)?;
    let client = cfg.http_client()?;

    match cli.command {
        Command::Submit { prompt, course } => {
            let job_id = submit(&cfg, &client, &prompt, course).await?;
            println!("{job_id}");
        }
        Command::Watch { job_id, poll } => {
            watch(&cfg, client, JobId::from(job_id), poll).await?;
        }
        Command::Ask {
            prompt,
            course,
            poll,
        } => {
            let job_id = submit(&cfg, &client, &prompt, course).await?;
            println!("JobId: {job_id}");
            watch(&cfg, client, job_id, poll).await?;
        }
        Command::Config => {}
    }

    Ok(())
}

async fn submit(
    cfg: &Config,
    client: &Client,
    prompt: &str,
    course: Option<String>,
) -> Result<JobId> {
    let core = CoreClient::new(client.clone(), &cfg.core_url);
    let course = course.or_else(|| cfg.course_id.clone());
    core.create_lecture(prompt, course.as_deref())
        .await
        .context("提交 prompt 失败")
}

async fn watch(cfg: &Config, client: Client, job_id: JobId, poll_only: bool) -> Result<()> {
    let mut reconciler = Reconciler::new(job_id.clone(), cfg.layout_for(&job_id));
    let mut board = StatusBoard::new()?;

    if !poll_only {
        let stream_client = cfg.stream_client()?;
        match follow_push(cfg, &stream_client, &mut reconciler, &mut board).await? {
            PushEnd::Complete | PushEnd::Interrupted => return Ok(()),
            PushEnd::Fallback => {}
        }
    }

    poll(cfg, client, reconciler, board).await
}

enum PushEnd {
    Complete,
    Interrupted,
    Fallback,
}

async fn follow_push(
    cfg: &Config,
    client: &Client,
    reconciler: &mut Reconciler,
    board: &mut StatusBoard,
) -> Result<PushEnd> {
    let job_id = reconciler.job_id().clone();
    let mut subscription = match feed::subscribe(client, &cfg.status_url, &job_id) {
        Ok(sub) => sub.with_idle_timeout(cfg.push_idle_timeout()),
        Err(e) => {
            warn!(error = %e, "无法打开推送通道");
            board.println(&format!("[WARN] 无法打开推送通道 ({e})，改为轮询"));
            return Ok(PushEnd::Fallback);
        }
    };

    let end = tokio::select! {
        end = feed::follow(&mut subscription, reconciler, |view| board.render(&project(view))) => Some(end),
        _ = tokio::signal::ctrl_c() => None,
    };

    let Some(end) = end else {
        subscription.unsubscribe();
        board.abandon("已取消");
        return Ok(PushEnd::Interrupted);
    };

    match end {
        FollowEnd::Complete => {
            info!(%job_id, "全部步骤已完成");
            board.complete(&project(reconciler.view()));
            Ok(PushEnd::Complete)
        }
        FollowEnd::Settled => {
            board.abandon("生成失败");
            bail!("生成未能全部完成，失败的步骤: {}", failed_steps(reconciler));
        }
        FollowEnd::Closed => {
            board.println("[WARN] 推送通道已关闭，改为轮询");
            Ok(PushEnd::Fallback)
        }
        FollowEnd::Failed(e) => {
            board.println(&format!("[WARN] 推送通道出错 ({e})，改为轮询"));
            Ok(PushEnd::Fallback)
        }
    }
}

async fn poll(
    cfg: &Config,
    client: Client,
    reconciler: Reconciler,
    mut board: StatusBoard,
) -> Result<()> {
    let sources = PollSources {
        avatar: Arc::new(AvatarHttpSource::new(client.clone(), &cfg.avatar_url)),
        slides: Arc::new(SlidesHttpSource::new(client, &cfg.slides_url)),
    };
    let (handle, mut view_rx) = polling::start(reconciler, sources, &cfg.poll_settings());

    loop {
        let view = view_rx.borrow_and_update().clone();
        let state = project(&view);
        board.render(&state);

        if view.all_complete {
            handle.cancel();
            board.complete(&state);
            return Ok(());
        }

        if handle.is_finished() {
            // 两个循环都已停止但没有全部完成，说明有步骤失败
            board.abandon("轮询已结束");
            bail!("生成未能全部完成，失败的步骤: {}", failed_steps_of(&state));
        }

        tokio::select! {
            changed = view_rx.changed() => changed.context("状态通道已关闭")?,
            // 定期检查循环是否都已结束
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            _ = tokio::signal::ctrl_c() => {
                handle.cancel();
                board.abandon("已取消");
                return Ok(());
            }
        }
    }
}

fn failed_steps(reconciler: &Reconciler) -> String {
    failed_steps_of(&project(reconciler.view()))
}

fn failed_steps_of(state: &DisplayState) -> String {
    let failed: Vec<String> = state.failed.iter().map(ToString::to_string).collect();
    failed.join(", ")
}
