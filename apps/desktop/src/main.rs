use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{LearningClient, MissingSpeechSynthesizer, PyramidCoordinator, SubmitOutcome};
use shared::protocol::StepOption;
use storage::Preferences;
use tracing::warn;

mod config;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    email: String,
    #[arg(long)]
    password: String,
    #[arg(long)]
    language: Option<String>,
    /// Optional seed sentence for the pyramid; the backend generates one
    /// otherwise.
    #[arg(long)]
    seed_sentence: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();
    let mut settings = config::load_settings();
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    if let Some(language) = args.language {
        settings.language = language;
    }

    let prefs = Preferences::new(&settings.database_url)
        .await
        .with_context(|| format!("failed to open preference store at {}", settings.database_url))?;
    prefs.set_learning_language(&settings.language).await?;

    let client = LearningClient::new_with_dependencies(
        settings.server_url.as_str(),
        Arc::new(prefs),
        Arc::new(MissingSpeechSynthesizer),
    );

    if client.restore_session().await.unwrap_or(false) {
        println!("Resumed stored session.");
    } else {
        client.login(&args.email, &args.password).await?;
        println!("Logged in as {}.", args.email);
    }

    let coordinator = client.start_pyramid(settings.language.clone());
    coordinator.create_pyramid(args.seed_sentence).await?;
    run_pyramid_session(&coordinator).await?;

    Ok(())
}

async fn run_pyramid_session(coordinator: &Arc<PyramidCoordinator>) -> Result<()> {
    loop {
        let Some(view) = coordinator.step_view().await else {
            anyhow::bail!("no current step to render");
        };
        println!();
        println!(
            "Step {} ({}): {}",
            view.step_index + 1,
            view.step_type.as_str(),
            view.initial_sentence
        );
        println!("  meaning: {}", view.initial_sentence_meaning);
        for (index, option) in view.options.iter().enumerate() {
            println!("  [{index}] {}", render_option(option));
        }

        wait_until_submittable(coordinator).await;

        let choice = prompt_for_choice(view.options.len()).await?;
        if let Err(err) = coordinator.select_option(choice).await {
            println!("  ! {err}");
            continue;
        }
        match coordinator.submit_selection().await {
            Ok(SubmitOutcome::Advanced) => {}
            Ok(SubmitOutcome::TransitionPending { to, .. }) => {
                println!("  next up: a {} step", to.as_str());
                coordinator.confirm_transition().await?;
            }
            Ok(SubmitOutcome::Completed(summary)) => {
                println!();
                println!(
                    "Pyramid complete! +{} XP, {}s, accuracy {:.0}%",
                    summary.xp_awarded,
                    summary.duration_seconds,
                    f64::from(summary.accuracy) * 100.0
                );
                return Ok(());
            }
            Err(err) => {
                println!("  ! {err}");
            }
        }
    }
}

fn render_option(option: &StepOption) -> String {
    match option {
        StepOption::Expand {
            sentence,
            expand_word,
            ..
        } => format!("{sentence}  (adds \"{expand_word}\")"),
        StepOption::Shrink {
            sentence,
            removed_word,
            ..
        } => format!("{sentence}  (drops \"{removed_word}\")"),
        StepOption::Replace {
            sentence,
            replaced_word,
            changed_word,
            ..
        } => format!("{sentence}  (\"{replaced_word}\" -> \"{changed_word}\")"),
        StepOption::Paraphrase { sentence, .. } => format!("{sentence}  (paraphrase)"),
    }
}

/// A non-final step needs its preview before a submit can succeed; poll until
/// it lands rather than bouncing an error off the user.
async fn wait_until_submittable(coordinator: &Arc<PyramidCoordinator>) {
    for _ in 0..100 {
        let snapshot = coordinator.snapshot().await;
        let on_final = snapshot
            .pyramid
            .as_ref()
            .is_some_and(|pyramid| pyramid.on_final_step());
        if on_final || snapshot.preview_ready {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    warn!("next-step preview still missing after waiting; submit may fail");
}

async fn prompt_for_choice(option_count: usize) -> Result<usize> {
    loop {
        println!("choose an option (0-{}):", option_count.saturating_sub(1));
        let line = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).map(|_| line)
        })
        .await??;
        match line.trim().parse::<usize>() {
            Ok(choice) if choice < option_count => return Ok(choice),
            _ => println!("  ! not a valid option index"),
        }
    }
}
