// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mealcast Control CLI
//!
//! CLI tool for submitting recommendation jobs and following their results.
//!
//! Usage:
//!   mealcast-ctl <command> [options]
//!
//! Commands:
//!   status                        Show quota status
//!   submit home [options]         Submit a cook-at-home job and wait for the result
//!   submit away --lat <f> --lng <f> [options]
//!   watch [--seconds <n>]         Print recent plans as they arrive

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use mealcast_sdk::{
    AuthContext, AwayParameters, CanonicalPlan, HomeParameters, JobParameters, Orchestrator,
    OrchestratorConfig, SessionPhase,
};
use tracing::warn;

fn print_usage() {
    eprintln!(
        r#"Usage: mealcast-ctl <command> [options]

Submit meal recommendation jobs and follow their results.

COMMANDS:
    status                          Show quota status
    submit home                     Submit a cook-at-home job
    submit away                     Submit an eat-out job
    watch                           Print recent plans as they arrive

HOME OPTIONS:
    --pantry <a,b,c>                Pantry items
    --meal <type>                   Meal type (repeatable)
    --servings <n>                  Servings
    --max-minutes <n>               Maximum cooking time
    --cuisine <name>                Preferred cuisine
    --diet <a,b>                    Dietary preferences

AWAY OPTIONS:
    --lat <f>                       Latitude (required)
    --lng <f>                       Longitude (required)
    --radius-km <f>                 Search radius
    --cuisine <name>                Preferred cuisine
    --budget <text>                 Budget hint
    --diet <a,b>                    Dietary preferences

SUBMIT OPTIONS:
    --no-wait                       Return once the job is accepted
    --pick-latest                   In recovery, accept the most recent plan

WATCH OPTIONS:
    --seconds <n>                   Stop after n seconds (default: run until Ctrl-C)

ENVIRONMENT:
    MEALCAST_OWNER_ID               Owner id of the signed-in principal (required)
    MEALCAST_TOKEN                  Bearer token (required)
    MEALCAST_API_URL                Backend base URL (default: http://127.0.0.1:8080)
    RUST_LOG                        Log filter (default: mealcast_sdk=info)

EXAMPLES:
    # Check remaining quota
    mealcast-ctl status

    # Ask for dinner ideas from what is in the pantry
    mealcast-ctl submit home --pantry rice,eggs,spinach --meal dinner

    # Find somewhere to eat nearby
    mealcast-ctl submit away --lat 52.23 --lng 21.01 --cuisine italian
"#
    );
}

#[derive(Debug, PartialEq)]
enum Command {
    Status,
    Submit {
        parameters: JobParameters,
        wait: bool,
        pick_latest: bool,
    },
    Watch {
        seconds: Option<u64>,
    },
}

fn parse_args() -> Result<Command, String> {
    let args: Vec<String> = std::env::args().collect();
    parse_args_from_vec(&args)
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_number<T: std::str::FromStr>(flag: &str, raw: Option<&String>) -> Result<T, String> {
    let raw = raw.ok_or_else(|| format!("{} requires a value", flag))?;
    raw.parse()
        .map_err(|_| format!("{} expects a number, got '{}'", flag, raw))
}

fn parse_args_from_vec(args: &[String]) -> Result<Command, String> {
    if args.len() < 2 {
        return Err("No command specified".to_string());
    }

    match args[1].as_str() {
        "help" | "--help" | "-h" => {
            print_usage();
            std::process::exit(0);
        }
        "status" => Ok(Command::Status),
        "watch" => {
            let mut seconds = None;
            let mut i = 2;
            while i < args.len() {
                match args[i].as_str() {
                    "--seconds" => {
                        i += 1;
                        seconds = Some(parse_number("--seconds", args.get(i))?);
                    }
                    arg => return Err(format!("Unknown argument: {}", arg)),
                }
                i += 1;
            }
            Ok(Command::Watch { seconds })
        }
        "submit" => {
            let kind = args.get(2).ok_or("submit requires a kind (home or away)")?;
            let mut home = HomeParameters::default();
            let mut away = AwayParameters::default();
            let mut lat: Option<f64> = None;
            let mut lng: Option<f64> = None;
            let mut cuisine: Option<String> = None;
            let mut diet: Vec<String> = Vec::new();
            let mut wait = true;
            let mut pick_latest = false;

            let mut i = 3;
            while i < args.len() {
                match args[i].as_str() {
                    "--pantry" => {
                        i += 1;
                        home.pantry_items = split_list(args.get(i).ok_or("--pantry requires items")?);
                    }
                    "--meal" => {
                        i += 1;
                        home.meal_types
                            .push(args.get(i).ok_or("--meal requires a type")?.clone());
                    }
                    "--servings" => {
                        i += 1;
                        home.servings = Some(parse_number("--servings", args.get(i))?);
                    }
                    "--max-minutes" => {
                        i += 1;
                        home.max_minutes = Some(parse_number("--max-minutes", args.get(i))?);
                    }
                    "--lat" => {
                        i += 1;
                        lat = Some(parse_number("--lat", args.get(i))?);
                    }
                    "--lng" => {
                        i += 1;
                        lng = Some(parse_number("--lng", args.get(i))?);
                    }
                    "--radius-km" => {
                        i += 1;
                        away.radius_km = Some(parse_number("--radius-km", args.get(i))?);
                    }
                    "--budget" => {
                        i += 1;
                        away.budget = Some(args.get(i).ok_or("--budget requires a value")?.clone());
                    }
                    "--cuisine" => {
                        i += 1;
                        cuisine = Some(args.get(i).ok_or("--cuisine requires a value")?.clone());
                    }
                    "--diet" => {
                        i += 1;
                        diet = split_list(args.get(i).ok_or("--diet requires values")?);
                    }
                    "--no-wait" => wait = false,
                    "--pick-latest" => pick_latest = true,
                    arg => return Err(format!("Unknown argument: {}", arg)),
                }
                i += 1;
            }

            let parameters = match kind.as_str() {
                "home" => {
                    home.cuisine = cuisine;
                    home.dietary_preferences = diet;
                    JobParameters::Home(home)
                }
                "away" => {
                    away.latitude = lat.ok_or("--lat is required for away jobs")?;
                    away.longitude = lng.ok_or("--lng is required for away jobs")?;
                    away.cuisine = cuisine;
                    away.dietary_preferences = diet;
                    JobParameters::Away(away)
                }
                other => return Err(format!("Unknown job kind: {}", other)),
            };

            Ok(Command::Submit {
                parameters,
                wait,
                pick_latest,
            })
        }
        other => Err(format!("Unknown command: {}", other)),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mealcast_sdk=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let cmd = match parse_args() {
        Ok(cmd) => cmd,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            print_usage();
            return ExitCode::FAILURE;
        }
    };

    match run(cmd).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cmd: Command) -> anyhow::Result<()> {
    let config = OrchestratorConfig::from_env().context("invalid configuration")?;
    let owner_id = std::env::var("MEALCAST_OWNER_ID").context("MEALCAST_OWNER_ID is not set")?;
    let token = std::env::var("MEALCAST_TOKEN").context("MEALCAST_TOKEN is not set")?;
    let auth = AuthContext::login(owner_id, token);

    let orchestrator = Orchestrator::connect_http(config, Arc::new(auth.clone()))
        .await
        .context("failed to start orchestrator")?;

    let result = execute_command(&orchestrator, cmd).await;
    orchestrator.shutdown().await;
    auth.logout();
    result
}

async fn execute_command(orchestrator: &Orchestrator, cmd: Command) -> anyhow::Result<()> {
    match cmd {
        Command::Status => {
            let status = orchestrator.rate_limit_status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }

        Command::Submit {
            parameters,
            wait,
            pick_latest,
        } => {
            let submission = orchestrator.submit(parameters).await?;
            println!(
                "Submitted {} job {} (waiting until {})",
                submission.kind,
                submission.correlation_id,
                submission.deadline_at.to_rfc3339()
            );
            if !wait {
                return Ok(());
            }

            let mut state = orchestrator.observe();
            let settled = tokio::select! {
                settled = state.wait_for(|s| !s.phase.is_active() || matches!(s.phase, SessionPhase::Recovering { .. })) => {
                    settled?.clone()
                }
                _ = tokio::signal::ctrl_c() => {
                    orchestrator.cancel();
                    bail!("interrupted");
                }
            };

            match settled.phase {
                SessionPhase::Matched { plan, .. } => print_plan(&plan),
                SessionPhase::Recovering { candidates } => {
                    println!("No exact match arrived in time. Recent plans:");
                    for plan in &candidates {
                        println!("  {}  {}  ({})", plan.id, plan.title, plan.created_at.to_rfc3339());
                    }
                    if pick_latest && let Some(latest) = candidates.first() {
                        let plan = orchestrator.select_recovery_candidate(latest.id.clone()).await?;
                        print_plan(&plan);
                    }
                }
                SessionPhase::Error { failure } => {
                    println!("{}", serde_json::to_string_pretty(&failure)?);
                    bail!("job failed");
                }
                other => bail!("unexpected session phase: {}", other.name()),
            }
        }

        Command::Watch { seconds } => {
            let mut plans = orchestrator.recent_plans();
            let deadline = async {
                match seconds {
                    Some(s) => tokio::time::sleep(Duration::from_secs(s)).await,
                    None => std::future::pending().await,
                }
            };
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    changed = plans.changed() => {
                        changed?;
                        let view = plans.borrow_and_update().clone();
                        println!("--- {} plans ---", view.plans.len());
                        for plan in &view.plans {
                            println!("  [{}] {}  {}  ({} meals)", plan.kind, plan.id, plan.title, plan.meals.len());
                        }
                    }
                    _ = &mut deadline => break,
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
    }

    Ok(())
}

fn print_plan(plan: &CanonicalPlan) {
    println!("{}", plan.title);
    if !plan.greeting.is_empty() {
        println!("{}", plan.greeting);
    }
    for meal in &plan.meals {
        println!();
        println!("{}: {}", meal.label, meal.title);
        if let Some(time) = meal.estimated_time.known() {
            println!("  time: {}", time);
        }
        if let Some(calories) = meal.calories_per_serving.known() {
            println!("  calories: {}", calories);
        }
        if !meal.pantry_match_note.is_empty() {
            println!("  {}", meal.pantry_match_note);
        }
        for ingredient in &meal.ingredients {
            println!("  - {}", ingredient);
        }
        for (n, step) in meal.steps.iter().enumerate() {
            println!("  {}. {}", n + 1, step);
        }
    }
}
