use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// 打印详细日志
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    #[command(about = "重置 orpheus 的配置文件")]
    Config,
    #[command(about = "提交 prompt 并打印 JobId")]
    Submit {
        prompt: String,

        /// 课程 ID，缺省时使用配置文件中的 course_id
        #[arg(long, short = 'c', value_name = "ID")]
        course: Option<String>,
    },
    #[command(about = "跟踪一个已提交任务的生成进度")]
    Watch {
        job_id: String,

        /// 直接轮询各服务，不使用推送通道
        #[arg(long)]
        poll: bool,
    },
    #[command(about = "提交 prompt 并跟踪生成进度")]
    Ask {
        prompt: String,

        #[arg(long, short = 'c', value_name = "ID")]
        course: Option<String>,

        #[arg(long)]
        poll: bool,
    },
}

pub fn get_cli_args() -> Cli {
    Cli::parse()
}
