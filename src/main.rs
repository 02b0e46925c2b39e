use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use weibo_sync::config;
use weibo_sync::cursor::FeedKind;
use weibo_sync::model::{FeedEntry, UserId};
use weibo_sync::push::ChannelPush;
use weibo_sync::store::LoadOutcome;
use weibo_sync::SyncContext;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FeedArg {
    Global,
    Friends,
    Following,
    /// Posts by --user (defaults to the viewer)
    User,
    /// Posts liked by --user (defaults to the viewer)
    Liked,
}

impl FeedArg {
    fn kind(self, user: UserId) -> FeedKind {
        match self {
            FeedArg::Global => FeedKind::Global,
            FeedArg::Friends => FeedKind::Friends,
            FeedArg::Following => FeedKind::Following,
            FeedArg::User => FeedKind::UserPosts(user),
            FeedArg::Liked => FeedKind::Liked(user),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load pages of a feed and print them
    Feed {
        #[arg(value_enum, default_value = "global")]
        kind: FeedArg,
        #[arg(long)]
        user: Option<UserId>,
        #[arg(long, default_value_t = 1)]
        pages: u32,
    },
    /// Print unread notification counters
    Unread,
    /// Like a post found in the first page of a feed
    Like {
        post_id: i64,
        #[arg(long, value_enum, default_value = "global")]
        from: FeedArg,
    },
    /// Remove a like from a post found in the first page of a feed
    Unlike {
        post_id: i64,
        #[arg(long, value_enum, default_value = "global")]
        from: FeedArg,
    },
}

fn print_entry(entry: &FeedEntry) {
    let text = entry.content.as_deref().unwrap_or("").replace('\n', " ");
    println!(
        "{:>8}  @{:<16} {:>4} likes {:>4} comments  {}{}",
        entry.id,
        entry.user.username,
        entry.like_count,
        entry.comment_count,
        if entry.liked { "[liked] " } else { "" },
        text
    );
    if let Some(reference) = &entry.ref_post {
        println!(
            "{:>8}  > @{}: {}",
            "",
            reference.user.username,
            reference.content.as_deref().unwrap_or("")
        );
    }
}

async fn set_like(ctx: &SyncContext, post_id: i64, from: FeedKind, liked: bool) -> Result<()> {
    ctx.posts.load_initial(from).await?;
    ctx.mutations.set_like(post_id, liked).await?;
    if let Some(entry) = ctx.posts.get(from, post_id) {
        print_entry(&entry);
    }
    Ok(())
}

async fn run(ctx: &SyncContext, command: Command, viewer: UserId) -> Result<()> {
    match command {
        Command::Feed { kind, user, pages } => {
            let kind = kind.kind(user.unwrap_or(viewer));
            info!(%kind, pages, "loading feed");
            let mut outcome = ctx.posts.load_initial(kind).await?;
            for _ in 1..pages {
                if matches!(outcome, LoadOutcome::Loaded { exhausted: true, .. }) {
                    break;
                }
                outcome = ctx.posts.load_more(kind).await?;
            }
            let snapshot = ctx.posts.snapshot(kind);
            for entry in &snapshot.entries {
                print_entry(entry);
            }
            println!(
                "-- {} entries{}",
                snapshot.entries.len(),
                if snapshot.exhausted { ", end of feed" } else { "" }
            );
        }
        Command::Unread => {
            let counts = ctx.aggregator.initialize().await?;
            println!(
                "follow {}  like {}  comment {}  total {}",
                counts.follow,
                counts.like,
                counts.comment,
                counts.total()
            );
        }
        Command::Like { post_id, from } => set_like(ctx, post_id, from.kind(viewer), true).await?,
        Command::Unlike { post_id, from } => {
            set_like(ctx, post_id, from.kind(viewer), false).await?
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    let seed = cfg
        .session
        .clone()
        .ok_or_else(|| anyhow!("config has no session section; add a token and user_id"))?;

    let ctx = SyncContext::from_config(&cfg, Arc::new(ChannelPush::new()))?;
    ctx.login(seed.token, seed.user_id);

    let result = run(&ctx, args.command, seed.user_id).await;

    if let Err(err) = &result {
        error!(?err, "command failed");
    }
    ctx.logout();
    result
}
