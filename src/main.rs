#![forbid(unsafe_code)]

#[macro_use]
extern crate rocket;
#[macro_use]
extern crate serde;
#[macro_use]
extern crate serde_json;
#[macro_use]
extern crate log;
#[macro_use]
extern crate diesel;
#[macro_use]
extern crate diesel_migrations;

use std::{
    fs,
    path::Path,
    process::exit,
    str::FromStr,
    thread,
    time::Duration,
};

#[macro_use]
mod error;
#[macro_use]
mod util;

mod api;
mod auth;
mod cache;
mod clock;
mod config;
mod crypto;
mod db;
mod dispatch;
mod locks;
mod mail;

pub use config::CONFIG;
pub use error::{Error, MapResult};

use rocket::data::{Limits, ToByteUnit};

#[cfg(feature = "enable_mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub const VERSION: Option<&str> = option_env!("MUSTER_VERSION");

#[rocket::main]
async fn main() -> Result<(), Error> {
    parse_args();
    launch_info();

    let extra_debug = init_logging()?;

    check_data_folder();
    auth::load_token_secret();

    let pool = create_db_pool().await;
    dispatch::start_side_effect_dispatcher(pool.clone());
    schedule_jobs(pool.clone());

    launch_rocket(pool, extra_debug).await // Blocks until program termination.
}

const HELP: &str = "\
muster - a self-hosted event sign-up service

USAGE:
    muster

FLAGS:
    -h, --help       Prints help information
    -v, --version    Prints the app version
";

pub const NO_VERSION: &str = "(Version info from Git not present)";

fn parse_args() {
    let mut pargs = pico_args::Arguments::from_env();

    if pargs.contains(["-h", "--help"]) {
        println!("{HELP}");
        exit(0);
    } else if pargs.contains(["-v", "--version"]) {
        println!("muster {}", VERSION.unwrap_or(NO_VERSION));
        exit(0);
    }
}

fn launch_info() {
    println!(
        "\
/--------------------------------------------------------------------\\
|                          Starting Muster                           |"
    );

    if let Some(version) = VERSION {
        println!("|{:^68}|", format!("Version {version}"));
    }

    println!(
        "\
|--------------------------------------------------------------------|
| This is an event sign-up server, the registration engine included. |
| Report bugs and request features through the issue tracker.        |
\\--------------------------------------------------------------------/\n"
    );
}

fn init_logging() -> Result<bool, Error> {
    let log_level = match log::LevelFilter::from_str(&CONFIG.log_level()) {
        Ok(level) => level,
        Err(_) => {
            println!("Log level must be one of: trace, debug, info, warn, error, off");
            exit(1);
        }
    };

    // Rocket and some dependencies are chatty at the configured level;
    // keep their targets one notch quieter unless we are debugging.
    let extra_debug = log_level >= log::LevelFilter::Debug;
    let dep_level = if extra_debug {
        log_level
    } else {
        log::LevelFilter::Warn
    };

    let mut logger = fern::Dispatch::new()
        .level(log_level)
        .level_for("rocket::launch", log::LevelFilter::Error)
        .level_for("rocket::launch_", log::LevelFilter::Error)
        .level_for("rocket::rocket", log::LevelFilter::Warn)
        .level_for("rocket::server", dep_level)
        .level_for("hyper::proto", log::LevelFilter::Off)
        .level_for("hyper::client", log::LevelFilter::Off)
        .level_for("handlebars::render", dep_level)
        .level_for("lettre::transport::smtp", dep_level)
        .chain(std::io::stdout());

    if CONFIG.extended_logging() {
        let timestamp_format = CONFIG.log_timestamp_format();
        logger = logger.format(move |out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}] {}",
                chrono::Local::now().format(&timestamp_format),
                record.target(),
                record.level(),
                message
            ))
        });
    } else {
        logger = logger.format(|out, message, _| out.finish(format_args!("{message}")));
    }

    if let Some(log_file) = CONFIG.log_file() {
        match fern::log_file(&log_file) {
            Ok(file) => {
                logger = logger.chain(file);
            }
            Err(e) => {
                println!("Unable to open log file {log_file}: {e:?}");
                exit(1);
            }
        }
    }

    if let Err(e) = logger.apply() {
        println!("Unable to initialize the logger: {e:?}");
        exit(1);
    }

    Ok(extra_debug)
}

fn check_data_folder() {
    let data_folder = &CONFIG.data_folder();
    let path = Path::new(data_folder);
    if !path.exists() {
        if let Err(e) = fs::create_dir_all(path) {
            error!("Could not create data folder '{data_folder}': {e:?}");
            exit(1);
        }
    }
    if !path.is_dir() {
        error!("Data folder '{data_folder}' is not a directory");
        exit(1);
    }
}

async fn create_db_pool() -> db::DbPool {
    match util::retry_db(db::DbPool::from_config, CONFIG.db_connection_retries()) {
        Ok(pool) => pool,
        Err(e) => {
            error!("Error creating database pool: {e:?}");
            exit(1);
        }
    }
}

async fn launch_rocket(pool: db::DbPool, extra_debug: bool) -> Result<(), Error> {
    let mut config = rocket::Config::from(rocket::Config::figment());
    config.cli_colors = false;
    config.limits = Limits::new().limit("json", 10.megabytes());

    let instance = rocket::custom(config)
        .mount("/", api::core_routes())
        .mount("/ws", api::notifications_routes())
        .manage(pool)
        .attach(util::AppHeaders())
        .attach(util::BetterLogging(extra_debug))
        .ignite()
        .await?;

    CONFIG.set_rocket_shutdown_handle(instance.shutdown());

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.expect("Error setting Ctrl-C handler");
        info!("Exiting muster!");
        CONFIG.shutdown();
    });

    let _ = instance.launch().await?;

    info!("Muster process exited!");
    Ok(())
}

fn schedule_jobs(pool: db::DbPool) {
    if CONFIG.job_poll_interval_ms() == 0 {
        info!("Job scheduler disabled.");
        return;
    }

    let runtime = tokio::runtime::Runtime::new().unwrap();

    thread::Builder::new()
        .name("job-scheduler".to_string())
        .spawn(move || {
            use job_scheduler_ng::{Job, JobScheduler};
            let _runtime_guard = runtime.enter();

            let mut sched = JobScheduler::new();

            // Derive upcoming/ongoing/completed from the clock once a minute.
            if !CONFIG.event_status_schedule().is_empty() {
                let pool = pool.clone();
                let handle = runtime.handle().clone();
                sched.add(Job::new(CONFIG.event_status_schedule().parse().unwrap(), move || {
                    handle.spawn(api::status_sweep_job(pool.clone()));
                }));
            }

            // Reconcile persisted signup counters with the registrations.
            if !CONFIG.counter_sweep_schedule().is_empty() {
                let pool = pool.clone();
                let handle = runtime.handle().clone();
                sched.add(Job::new(CONFIG.counter_sweep_schedule().parse().unwrap(), move || {
                    handle.spawn(api::counter_sweep_job(pool.clone()));
                }));
            }

            // Drop audit entries past the retention window.
            if !CONFIG.audit_cleanup_schedule().is_empty() {
                let pool = pool.clone();
                let handle = runtime.handle().clone();
                sched.add(Job::new(CONFIG.audit_cleanup_schedule().parse().unwrap(), move || {
                    handle.spawn(api::audit_cleanup_job(pool.clone()));
                }));
            }

            // Periodically check for jobs to run. We probably won't need any
            // jobs that run more often than once a minute, so a default poll
            // interval of 30 seconds should be sufficient.
            loop {
                sched.tick();
                runtime.block_on(tokio::time::sleep(Duration::from_millis(CONFIG.job_poll_interval_ms())));
            }
        })
        .expect("Error spawning job scheduler thread");
}
