//
// Error generator macro
//
use std::fmt::{Debug, Display, Formatter};

macro_rules! make_error {
    ( $( $name:ident ( $ty:ty ): $show_cause:expr ),+ $(,)? ) => {
        const BAD_REQUEST: u16 = 400;

        pub enum ErrorSource { $($name( $ty )),+ }

        // The `message` is sent to the client; the wrapped source is only logged.
        // `error_code` is the HTTP status the edge layer answers with and is
        // derived from `kind` when one is set.
        pub struct Error {
            message: String,
            error: ErrorSource,
            error_code: u16,
            kind: Option<Kind>,
        }

        $(impl From<$ty> for Error {
            fn from(err: $ty) -> Self {
                Error {
                    message: String::from(stringify!($name)),
                    error: ErrorSource::$name(err),
                    error_code: BAD_REQUEST,
                    kind: None,
                }
            }
        })+

        impl Display for Error {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                match &self.error {$(
                    ErrorSource::$name(e) => {
                        if $show_cause {
                            write!(f, "{}. [CAUSE] {:?}", self.message, e)
                        } else {
                            write!(f, "{}", self.message)
                        }
                    },
                )+}
            }
        }
    };
}

use diesel::r2d2::PoolError as R2d2Err;
use diesel::result::Error as DieselErr;
use diesel::ConnectionError as DieselConErr;
use handlebars::RenderError as HbErr;
use jsonwebtoken::errors::Error as JwtErr;
use lettre::address::AddressError as AddrErr;
use lettre::error::Error as LettreErr;
use lettre::transport::smtp::Error as SmtpErr;
use chrono::ParseError as TimeErr;
use serde_json::{Error as SerdeErr, Value};
use std::io::Error as IoErr;

// Each variant wraps a source error of a different type; the bool after the
// variant controls whether the cause is included when the error is logged.
make_error! {
    // Used to represent err! calls
    Simple(String):      false,
    // Used for special return values that carry a payload, like conflict lists
    Json(Value):         false,

    Db(DieselErr):       true,
    DbCon(DieselConErr): true,
    R2d2(R2d2Err):       true,
    Serde(SerdeErr):     true,
    Handlebars(HbErr):   true,
    Io(IoErr):           true,
    Time(TimeErr):       true,
    Jwt(JwtErr):         true,
    Address(AddrErr):    true,
    Smtp(SmtpErr):       true,
    Lettre(LettreErr):   true,
    Rocket(rocket::Error): true,
}

/// The business error kinds of the registration engine. The edge layer maps
/// them 1:1 onto HTTP statuses; the name is also included in the JSON body so
/// clients can branch without parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Unauthorized,
    Forbidden,
    NotFound,
    InvalidState,
    Duplicate,
    CapacityFull,
    QuotaExceeded,
    RoleHasRegistrants,
    CapacityBelowUsage,
    Conflict,
    Unavailable,
    Validation,
}

impl Kind {
    pub fn status(&self) -> u16 {
        match self {
            Kind::Unauthorized => 401,
            Kind::Forbidden => 403,
            Kind::NotFound => 404,
            Kind::Duplicate
            | Kind::CapacityFull
            | Kind::RoleHasRegistrants
            | Kind::CapacityBelowUsage
            | Kind::Conflict => 409,
            Kind::Unavailable => 503,
            Kind::InvalidState | Kind::QuotaExceeded | Kind::Validation => 400,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Unauthorized => "Unauthorized",
            Kind::Forbidden => "Forbidden",
            Kind::NotFound => "NotFound",
            Kind::InvalidState => "InvalidState",
            Kind::Duplicate => "Duplicate",
            Kind::CapacityFull => "CapacityFull",
            Kind::QuotaExceeded => "QuotaExceeded",
            Kind::RoleHasRegistrants => "RoleHasRegistrants",
            Kind::CapacityBelowUsage => "CapacityBelowUsage",
            Kind::Conflict => "Conflict",
            Kind::Unavailable => "Unavailable",
            Kind::Validation => "Validation",
        }
    }
}

impl Error {
    pub fn new<M: Into<String>, N: Into<String>>(usr_msg: M, log_msg: N) -> Self {
        Error {
            message: usr_msg.into(),
            error: ErrorSource::Simple(log_msg.into()),
            error_code: BAD_REQUEST,
            kind: None,
        }
    }

    pub fn json(value: Value) -> Self {
        Error {
            message: String::new(),
            error: ErrorSource::Json(value),
            error_code: BAD_REQUEST,
            kind: None,
        }
    }

    #[must_use]
    pub fn with_msg<M: Into<String>>(mut self, msg: M) -> Self {
        self.message = msg.into();
        self
    }

    #[must_use]
    pub fn with_kind(mut self, kind: Kind) -> Self {
        self.error_code = kind.status();
        self.kind = Some(kind);
        self
    }

    pub fn kind(&self) -> Option<Kind> {
        self.kind
    }

    /// True when the wrapped diesel error is a violation of a unique
    /// constraint, the store-level second line of defense against concurrent
    /// duplicate inserts.
    pub fn is_unique_violation(&self) -> bool {
        matches!(
            &self.error,
            ErrorSource::Db(DieselErr::DatabaseError(diesel::result::DatabaseErrorKind::UniqueViolation, _))
        )
    }

    fn body(&self) -> String {
        match &self.error {
            ErrorSource::Json(json) => {
                let mut body = json.clone();
                if let (Some(kind), Some(obj)) = (self.kind, body.as_object_mut()) {
                    obj.entry("errorKind").or_insert_with(|| kind.as_str().into());
                }
                body.to_string()
            }
            _ => json!({
                "message": self.message,
                "errorKind": self.kind.unwrap_or(Kind::Validation).as_str(),
                "object": "error",
            })
            .to_string(),
        }
    }
}

impl Debug for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::new(msg, msg)
    }
}

pub trait MapResult<S> {
    fn map_res(self, msg: &str) -> Result<S, Error>;
}

impl<S, E: Into<Error>> MapResult<S> for Result<S, E> {
    fn map_res(self, msg: &str) -> Result<S, Error> {
        self.map_err(|e| e.into().with_msg(msg))
    }
}

impl<E: Into<Error>> MapResult<()> for Result<usize, E> {
    fn map_res(self, msg: &str) -> Result<(), Error> {
        self.and(Ok(())).map_res(msg)
    }
}

impl<T> MapResult<T> for Option<T> {
    fn map_res(self, msg: &str) -> Result<T, Error> {
        self.ok_or_else(|| Error::new(msg, ""))
    }
}

//
// Rocket responder impl
//
use std::io::Cursor;

use rocket::http::{ContentType, Status};
use rocket::request::Request;
use rocket::response::{self, Responder, Response};

impl<'r> Responder<'r, 'static> for Error {
    fn respond_to(self, _: &Request<'_>) -> response::Result<'static> {
        match self.error {
            ErrorSource::Simple(_) | ErrorSource::Json(_) => {}
            _ => error!(target: "error", "{self}"),
        };

        let code = Status::from_code(self.error_code).unwrap_or(Status::BadRequest);
        let body = self.body();
        Response::build().status(code).header(ContentType::JSON).sized_body(Some(body.len()), Cursor::new(body)).ok()
    }
}

//
// Error return macros
//
#[macro_export]
macro_rules! err {
    ($msg:expr) => {{
        error!("{}", $msg);
        return Err($crate::error::Error::new($msg, $msg));
    }};
    ($usr_msg:expr, $log_value:expr) => {{
        error!("{}. {}", $usr_msg, $log_value);
        return Err($crate::error::Error::new($usr_msg, $log_value));
    }};
}

#[macro_export]
macro_rules! err_silent {
    ($msg:expr) => {{
        return Err($crate::error::Error::new($msg, $msg));
    }};
    ($usr_msg:expr, $log_value:expr) => {{
        return Err($crate::error::Error::new($usr_msg, $log_value));
    }};
}

/// Fail with one of the named engine error kinds; the HTTP status follows
/// from the kind.
#[macro_export]
macro_rules! err_kind {
    ($kind:ident, $msg:expr) => {{
        warn!("{}: {}", $crate::error::Kind::$kind.as_str(), $msg);
        return Err($crate::error::Error::new($msg, $msg).with_kind($crate::error::Kind::$kind));
    }};
    ($kind:ident, $usr_msg:expr, $log_value:expr) => {{
        warn!("{}: {}. {}", $crate::error::Kind::$kind.as_str(), $usr_msg, $log_value);
        return Err($crate::error::Error::new($usr_msg, $log_value).with_kind($crate::error::Kind::$kind));
    }};
}

#[macro_export]
macro_rules! err_json {
    ($expr:expr, $log_value:expr) => {{
        return Err($crate::error::Error::json($expr).with_msg($log_value));
    }};
    ($expr:expr, $log_value:expr, $kind:ident) => {{
        return Err($crate::error::Error::json($expr)
            .with_msg($log_value)
            .with_kind($crate::error::Kind::$kind));
    }};
}

#[macro_export]
macro_rules! err_handler {
    ($expr:expr) => {{
        error!(target: "auth", "Unauthorized Error: {}", $expr);
        return ::rocket::request::Outcome::Error((rocket::http::Status::Unauthorized, $expr));
    }};
}
