use anyhow::Result;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use orpheus::projector::{DisplayState, Indicator, StepId};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

struct StepBar {
    bar: ProgressBar,
    indicator: Indicator,
}

/// 终端上的进度面板：每个已开始的步骤占一行
pub struct StatusBoard {
    mp: MultiProgress,
    spinner_style: ProgressStyle,
    done_style: ProgressStyle,
    steps: HashMap<StepId, StepBar>,
    slides: Option<ProgressBar>,
    announced: HashSet<StepId>,
}

impl StatusBoard {
    pub fn new() -> Result<Self> {
        Ok(Self {
            mp: MultiProgress::new(),
            spinner_style: ProgressStyle::with_template("{spinner:.green}  {msg}")?,
            done_style: ProgressStyle::with_template("{msg}")?,
            steps: HashMap::new(),
            slides: None,
            announced: HashSet::new(),
        })
    }

    /// 在进度条上方输出消息，不会干扰进度条显示
    pub fn println(&self, msg: &str) {
        // 输出不是终端时进度条被隐藏，println 也会被吞掉
        if self.mp.is_hidden() {
            println!("{msg}");
            return;
        }
        self.mp.println(msg).unwrap_or_else(|_| {
            println!("{msg}");
        });
    }

    pub fn render(&mut self, state: &DisplayState) {
        for line in &state.steps {
            self.update_step(line.id, line.indicator);
        }

        if state.slides.total > 0 {
            let bar = self.slides.get_or_insert_with(|| {
                let bar = self.mp.add(ProgressBar::new(state.slides.total as u64));
                if let Ok(style) = ProgressStyle::with_template(
                    "   Slides [{bar:30.cyan/blue}] {pos}/{len}",
                ) {
                    bar.set_style(style.progress_chars("#>-"));
                }
                bar
            });
            bar.set_length(state.slides.total as u64);
            bar.set_position(u64::from(state.slides.generated));
        }

        for unit in &state.avatar {
            self.update_step(StepId::AvatarVideo(unit.index), unit.video);
            self.update_step(StepId::AvatarAudio(unit.index), unit.audio);
        }

        // 每个失败的步骤只提示一次
        for id in &state.failed {
            if self.announced.insert(*id) {
                self.println(&format!("[WARN] 步骤失败: {id}"));
            }
        }
    }

    fn update_step(&mut self, id: StepId, indicator: Indicator) {
        if indicator == Indicator::Hidden {
            return;
        }
        if self.steps.get(&id).is_some_and(|s| s.indicator == indicator) {
            return;
        }

        let bar = match self.steps.get(&id) {
            Some(step) => step.bar.clone(),
            None => self.mp.add(ProgressBar::new_spinner()),
        };

        match indicator {
            Indicator::Spinner => {
                bar.set_style(self.spinner_style.clone());
                bar.set_message(id.to_string());
                bar.enable_steady_tick(Duration::from_millis(100));
            }
            Indicator::Check => {
                bar.set_style(self.done_style.clone());
                bar.finish_with_message(format!("✔  {id}"));
            }
            Indicator::Cross => {
                bar.set_style(self.done_style.clone());
                bar.abandon_with_message(format!("✘  {id}"));
            }
            Indicator::Hidden => {}
        }

        self.steps.insert(id, StepBar { bar, indicator });
    }

    /// 停止所有仍在转动的步骤
    pub fn abandon(&mut self, msg: &str) {
        for step in self.steps.values() {
            if step.indicator == Indicator::Spinner {
                step.bar.abandon();
            }
        }
        if let Some(bar) = &self.slides {
            bar.abandon();
        }
        self.println(msg);
    }

    /// 全部完成后打印摘要与播放列表
    pub fn complete(&mut self, state: &DisplayState) {
        self.render(state);
        if let Some(bar) = &self.slides {
            bar.finish();
        }

        self.println(&format!("\n{}", state.summary));
        if !state.outline.is_empty() {
            self.println("\n大纲:");
            for (i, content) in state.outline.iter().enumerate() {
                self.println(&format!("  {}. {}", i + 1, content));
            }
        }
        self.println("\n播放列表:");
        for url in &state.playlist {
            self.println(&format!("  {url}"));
        }
    }
}
