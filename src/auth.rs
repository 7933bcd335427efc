//
// JWT Handling
//
use chrono::{TimeDelta, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header};
use serde::de::DeserializeOwned;
use serde::ser::Serialize;
use std::sync::LazyLock;

use crate::{error::Error, CONFIG};

const JWT_ALGORITHM: Algorithm = Algorithm::HS256;

pub static DEFAULT_VALIDITY: LazyLock<TimeDelta> = LazyLock::new(|| TimeDelta::try_hours(2).unwrap());

pub static JWT_LOGIN_ISSUER: LazyLock<String> = LazyLock::new(|| format!("{}|login", CONFIG.domain_origin()));
static JWT_DECLINE_ISSUER: LazyLock<String> = LazyLock::new(|| format!("{}|decline", CONFIG.domain_origin()));

static TOKEN_SECRET: LazyLock<Vec<u8>> = LazyLock::new(|| {
    let path = CONFIG.token_secret_file();
    match crate::util::read_file_string(&path) {
        Ok(secret) if !secret.trim().is_empty() => secret.trim().as_bytes().to_vec(),
        _ => {
            let secret = crate::crypto::encode_random_bytes::<64>(data_encoding::BASE64);
            crate::util::write_file(&path, secret.as_bytes()).unwrap_or_else(|e| {
                panic!("Error writing token secret to {path}: {e}");
            });
            info!("Generated a new token secret at {path}");
            secret.into_bytes()
        }
    }
});

static ENCODING_KEY: LazyLock<EncodingKey> = LazyLock::new(|| EncodingKey::from_secret(&TOKEN_SECRET));
static DECODING_KEY: LazyLock<DecodingKey> = LazyLock::new(|| DecodingKey::from_secret(&TOKEN_SECRET));

/// Forces the lazy secret to materialize during startup, so a broken data
/// folder aborts the launch instead of the first request.
pub fn load_token_secret() {
    LazyLock::force(&TOKEN_SECRET);
}

pub fn encode_jwt<T: Serialize>(claims: &T) -> String {
    match jsonwebtoken::encode(&Header::new(JWT_ALGORITHM), claims, &ENCODING_KEY) {
        Ok(token) => token,
        Err(e) => panic!("Error encoding jwt {e}"),
    }
}

fn decode_jwt<T: DeserializeOwned>(token: &str, issuer: String) -> Result<T, Error> {
    let mut validation = jsonwebtoken::Validation::new(JWT_ALGORITHM);
    validation.leeway = 30; // 30 seconds
    validation.validate_exp = true;
    validation.validate_nbf = true;
    validation.set_issuer(&[issuer]);

    let token = token.replace(char::is_whitespace, "");
    match jsonwebtoken::decode(&token, &DECODING_KEY, &validation) {
        Ok(d) => Ok(d.claims),
        Err(err) => match *err.kind() {
            jsonwebtoken::errors::ErrorKind::InvalidToken => err_silent!("Token is invalid"),
            jsonwebtoken::errors::ErrorKind::InvalidIssuer => err_silent!("Issuer is invalid"),
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => err_silent!("Token has expired"),
            _ => err_silent!("Error decoding JWT"),
        },
    }
}

pub fn decode_login(token: &str) -> Result<LoginJwtClaims, Error> {
    decode_jwt(token, JWT_LOGIN_ISSUER.to_string())
}

pub fn decode_decline(token: &str) -> Result<DeclineJwtClaims, Error> {
    decode_jwt(token, JWT_DECLINE_ISSUER.to_string())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginJwtClaims {
    // Not before
    pub nbf: i64,
    // Expiration time
    pub exp: i64,
    // Issuer
    pub iss: String,
    // Subject: the user uuid
    pub sub: String,

    pub email: String,
}

pub fn generate_login_claims(user: &crate::db::models::User) -> LoginJwtClaims {
    let time_now = Utc::now();
    LoginJwtClaims {
        nbf: time_now.timestamp(),
        exp: (time_now + *DEFAULT_VALIDITY).timestamp(),
        iss: JWT_LOGIN_ISSUER.to_string(),
        sub: user.uuid.clone(),
        email: user.email.clone(),
    }
}

/// The "rejection token" included in role invitations. It binds the created
/// registration to the assignee so they can decline through an
/// unauthenticated endpoint until the token expires.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeclineJwtClaims {
    // Not before
    pub nbf: i64,
    // Expiration time
    pub exp: i64,
    // Issuer
    pub iss: String,
    // Subject: the assignee user uuid
    pub sub: String,

    pub registration_uuid: String,
}

pub fn generate_decline_claims(registration_uuid: String, assignee_uuid: String) -> DeclineJwtClaims {
    let time_now = Utc::now();
    let expiry_days = CONFIG.invitation_expiry_days();
    DeclineJwtClaims {
        nbf: time_now.timestamp(),
        exp: (time_now + TimeDelta::try_days(expiry_days).unwrap_or(*DEFAULT_VALIDITY)).timestamp(),
        iss: JWT_DECLINE_ISSUER.to_string(),
        sub: assignee_uuid,
        registration_uuid,
    }
}

//
// Request guards
//
use rocket::{
    http::Status,
    outcome::try_outcome,
    request::{FromRequest, Outcome, Request},
};

use crate::db::{
    models::{User, UserRole},
    DbConn,
};

pub struct Headers {
    pub user: User,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for Headers {
    type Error = &'static str;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let headers = request.headers();

        // Get access_token
        let access_token: &str = match headers.get_one("Authorization") {
            Some(a) => match a.rsplit("Bearer ").next() {
                Some(split) => split,
                None => err_handler!("No access token provided"),
            },
            None => err_handler!("No access token provided"),
        };

        // Check JWT token is valid and get user from it
        let Ok(claims) = decode_login(access_token) else {
            err_handler!("Invalid claim")
        };

        let conn = match DbConn::from_request(request).await {
            Outcome::Success(conn) => conn,
            _ => err_handler!("Error getting DB"),
        };

        let Some(user) = User::find_by_uuid(&claims.sub, &conn).await else {
            err_handler!("Token user does not exist")
        };

        if !user.is_active {
            return Outcome::Error((Status::Locked, "This account has been locked"));
        }

        Outcome::Success(Headers {
            user,
        })
    }
}

pub struct AdminHeaders {
    pub user: User,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AdminHeaders {
    type Error = &'static str;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let headers = try_outcome!(Headers::from_request(request).await);
        if headers.user.atype >= UserRole::Administrator {
            Outcome::Success(Self {
                user: headers.user,
            })
        } else {
            err_handler!("You need to be an Administrator to call this endpoint")
        }
    }
}

impl From<AdminHeaders> for Headers {
    fn from(h: AdminHeaders) -> Headers {
        Headers {
            user: h.user,
        }
    }
}
