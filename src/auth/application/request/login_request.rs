use serde::Serialize;

/// Body of `POST /access/ticket`. `username` carries the realm (`root@pam`).
#[derive(Serialize)]
pub struct LoginRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
}
