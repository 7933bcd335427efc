//
// Web Headers and caching
//
use std::collections::HashMap;

use rocket::{
    fairing::{Fairing, Info, Kind},
    http::Method,
    Data, Orbit, Request, Response, Rocket,
};

use crate::CONFIG;

pub struct AppHeaders();

#[rocket::async_trait]
impl Fairing for AppHeaders {
    fn info(&self) -> Info {
        Info {
            name: "Application Headers",
            kind: Kind::Response,
        }
    }

    async fn on_response<'r>(&self, _req: &'r Request<'_>, res: &mut Response<'r>) {
        res.set_raw_header("Referrer-Policy", "same-origin");
        res.set_raw_header("X-Content-Type-Options", "nosniff");
        res.set_raw_header("X-Frame-Options", "SAMEORIGIN");
        res.set_raw_header("X-XSS-Protection", "0");

        // Disable cache unless otherwise specified
        if !res.headers().contains("cache-control") {
            res.set_raw_header("Cache-Control", "no-cache, no-store, max-age=0");
        }
    }
}

// Log all the routes from the main paths list
// Effectively ignores any static file route, and the alive endpoint
const LOGGED_ROUTES: [&str; 4] = ["/events", "/registrations", "/system-messages", "/ws"];

// Boolean is extra debug, when true, we ignore the whitelist above and also print the mounts
pub struct BetterLogging(pub bool);

#[rocket::async_trait]
impl Fairing for BetterLogging {
    fn info(&self) -> Info {
        Info {
            name: "Better Logging",
            kind: Kind::Liftoff | Kind::Request | Kind::Response,
        }
    }

    async fn on_liftoff(&self, rocket: &Rocket<Orbit>) {
        if self.0 {
            info!(target: "routes", "Routes loaded:");
            let mut routes: Vec<_> = rocket.routes().collect();
            routes.sort_by_key(|r| r.uri.path());
            for route in routes {
                if route.rank < 0 {
                    info!(target: "routes", "{:<6} {}", route.method, route.uri);
                } else {
                    info!(target: "routes", "{:<6} {} [{}]", route.method, route.uri, route.rank);
                }
            }
        }

        let config = rocket.config();
        let scheme = if config.tls_enabled() {
            "https"
        } else {
            "http"
        };
        let addr = format!("{}://{}:{}", &scheme, &config.address, &config.port);
        info!(target: "start", "Rocket has launched from {addr}");
    }

    async fn on_request(&self, request: &mut Request<'_>, _data: &mut Data<'_>) {
        let method = request.method();
        if !self.0 && method == Method::Options {
            return;
        }
        let uri = request.uri();
        let uri_path_str = uri.path().as_str();
        if self.0 || LOGGED_ROUTES.iter().any(|r| uri_path_str.starts_with(r)) {
            match uri.query() {
                Some(q) => {
                    let q = q.as_str();
                    info!(target: "request", "{} {}?{}", method, uri_path_str, &q[..q.len().min(30)]);
                }
                None => info!(target: "request", "{} {}", method, uri_path_str),
            };
        }
    }

    async fn on_response<'r>(&self, request: &'r Request<'_>, response: &mut Response<'r>) {
        if !self.0 && request.method() == Method::Options {
            return;
        }
        let uri_path_str = request.uri().path().as_str();
        if self.0 || LOGGED_ROUTES.iter().any(|r| uri_path_str.starts_with(r)) {
            let status = response.status();
            if let Some(route) = request.route() {
                info!(target: "response", "{} => {}", route, status)
            } else {
                info!(target: "response", "{}", status)
            }
        }
    }
}

//
// File handling
//
use std::{
    fs::{self, File},
    io::Result as IOResult,
    path::Path,
};

pub fn write_file(path: &str, content: &[u8]) -> Result<(), crate::error::Error> {
    use std::io::Write;
    let mut f = match File::create(path) {
        Ok(file) => file,
        Err(e) => {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                error!("Can't create '{}': Permission denied", path);
            }
            return Err(From::from(e));
        }
    };

    f.write_all(content)?;
    f.flush()?;
    Ok(())
}

pub fn read_file_string(path: &str) -> IOResult<String> {
    fs::read_to_string(Path::new(path))
}

//
// String util methods
//

pub fn get_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Returns the trimmed string, or `None` when nothing but whitespace remains.
pub fn trim_to_option(s: Option<&str>) -> Option<String> {
    match s.map(str::trim) {
        None | Some("") => None,
        Some(t) => Some(t.to_string()),
    }
}

//
// Env methods
//

fn get_env_str_value(key: &str) -> Option<String> {
    let key_file = format!("{key}_FILE");
    let value_from_env = std::env::var(key);
    let value_file = std::env::var(&key_file);

    match (value_from_env, value_file) {
        (Ok(_), Ok(_)) => panic!("You should not define both {key} and {key_file}!"),
        (Ok(v_env), Err(_)) => Some(v_env),
        (Err(_), Ok(v_file)) => match fs::read_to_string(v_file) {
            Ok(content) => Some(content.trim().to_string()),
            Err(e) => panic!("Failed to load {key}: {e:?}"),
        },
        _ => None,
    }
}

pub fn get_env<V>(key: &str) -> Option<V>
where
    V: FromStr,
{
    try_parse_string(get_env_str_value(key))
}

pub fn get_env_bool(key: &str) -> Option<bool> {
    const TRUE_VALUES: &[&str] = &["true", "t", "yes", "y", "1"];
    const FALSE_VALUES: &[&str] = &["false", "f", "no", "n", "0"];

    match get_env_str_value(key) {
        Some(val) if TRUE_VALUES.contains(&val.to_lowercase().as_ref()) => Some(true),
        Some(val) if FALSE_VALUES.contains(&val.to_lowercase().as_ref()) => Some(false),
        _ => None,
    }
}

use std::str::FromStr;

pub fn try_parse_string<S, T>(string: Option<S>) -> Option<T>
where
    S: AsRef<str>,
    T: FromStr,
{
    if let Some(Ok(value)) = string.map(|s| s.as_ref().parse::<T>()) {
        Some(value)
    } else {
        None
    }
}

//
// Date util methods
//

use chrono::NaiveDateTime;

/// Formats a UTC-offset `NaiveDateTime` in the format used in API responses.
pub fn format_date(dt: &NaiveDateTime) -> String {
    dt.and_utc().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

//
// Deployment environment methods
//

/// Aggregates recipients by lowercased email so a person that appears both as
/// a participant and as a guest of the same event is notified once.
pub fn dedup_by_email<T, F>(items: Vec<T>, email_of: F) -> Vec<T>
where
    F: Fn(&T) -> String,
{
    let mut seen: HashMap<String, ()> = HashMap::new();
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let key = email_of(&item).to_lowercase();
        if key.is_empty() || seen.insert(key, ()).is_none() {
            out.push(item);
        }
    }
    out
}

use std::thread::sleep;
use std::time::Duration;

/// Retries a closure with exponential backoff, used around transient DB errors.
pub fn retry_db<F, T, E>(mut func: F, max_tries: u32) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    E: std::fmt::Debug,
{
    let mut tries = 0;

    loop {
        match func() {
            ok @ Ok(_) => return ok,
            Err(e) => {
                tries += 1;

                if tries >= max_tries && max_tries > 0 {
                    return Err(e);
                }

                warn!("Can't connect to database, retrying: {e:?}");

                sleep(Duration::from_millis(500 * u64::from(tries)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trim_to_option_drops_blank_strings() {
        assert_eq!(trim_to_option(None), None);
        assert_eq!(trim_to_option(Some("   ")), None);
        assert_eq!(trim_to_option(Some("  Main Hall ")), Some("Main Hall".to_string()));
    }

    #[test]
    fn dedup_by_email_is_case_insensitive_and_keeps_first() {
        let items = vec![("Ana", "ana@example.com"), ("Ana G.", "ANA@example.com"), ("Bo", "bo@example.com")];
        let out = dedup_by_email(items, |i| i.1.to_string());
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].0, "Ana");
        assert_eq!(out[1].0, "Bo");
    }
}
