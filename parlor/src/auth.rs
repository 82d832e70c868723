//! Pre-authentication traffic.
//!
//! The dispatcher never runs for a connection whose nickname is still empty;
//! everything such a connection sends lands here instead. Only `/register`
//! and `/login` are understood, both case-insensitively.
//!
//! Unknown-user and wrong-password failures produce the identical reply, so
//! a caller cannot probe which usernames exist.

use crate::context::ServerContext;
use crate::store::StoreError;
use crate::ClientId;
use ember::logging;
use ember::passwd;

const USAGE: &str = "请先登录。用法: /register <用户名> <密码> 或 /login <用户名> <密码>";
const BAD_CREDENTIALS: &str = "错误：用户名或密码不正确。";
const STORE_UNAVAILABLE: &str = "数据库错误，请稍后重试。";

/// Handle one message from an unauthenticated connection. Always produces a
/// reply for the caller.
pub fn handle_message(ctx: &ServerContext, id: ClientId, payload: &str) -> String {
    let tokens: Vec<&str> = payload.split_whitespace().collect();

    let command = match tokens.first() {
        Some(token) => token.to_lowercase(),
        None => return USAGE.to_string(),
    };

    match (command.as_str(), tokens.len()) {
        ("/register", 3) => register(ctx, tokens[1], tokens[2]),
        ("/login", 3) => login(ctx, id, tokens[1], tokens[2]),
        _ => USAGE.to_string(),
    }
}

fn register(ctx: &ServerContext, username: &str, password: &str) -> String {
    let lower = username.to_lowercase();

    match ctx.store.fetch_user(&lower) {
        Err(_) => return STORE_UNAVAILABLE.to_string(),
        Ok(Some(_)) => return format!("错误：用户名 '{}' 已被注册。", username),
        Ok(None) => {}
    }

    let hash = match passwd::hash_password(password) {
        Ok(hash) => hash,
        Err(err) => {
            logging::error!(ctx.log, "password hashing failed"; "error" => %err);
            return "错误：注册失败，请稍后重试。".to_string();
        }
    };

    match ctx.store.insert_user(username, &lower, &hash) {
        Ok(()) => "注册成功! 请使用 /login 登录。".to_string(),
        // Lost the race against a concurrent register for the same name.
        Err(StoreError::Duplicate) => format!("错误：用户名 '{}' 已被注册。", username),
        Err(_) => "数据库错误，注册失败。".to_string(),
    }
}

fn login(ctx: &ServerContext, id: ClientId, username: &str, password: &str) -> String {
    let lower = username.to_lowercase();

    let record = match ctx.store.fetch_user(&lower) {
        Err(_) => return STORE_UNAVAILABLE.to_string(),
        Ok(None) => return BAD_CREDENTIALS.to_string(),
        Ok(Some(record)) => record,
    };

    if !passwd::verify_password(password, &record.password_hash) {
        return BAD_CREDENTIALS.to_string();
    }

    if !ctx.clients.claim_nickname(id, &record.username, record.is_admin) {
        return "错误：该账号已在其他连接登录。".to_string();
    }

    logging::info!(ctx.log, "user logged in";
                   "client_id" => id, "nickname" => record.username.as_str(),
                   "admin" => record.is_admin);
    ctx.clients
        .broadcast(&format!("{} 加入聊天室", record.username), Some(id));
    format!("登录成功! 欢迎回来, {}。", record.username)
}
