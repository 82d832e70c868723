//! Command dispatch.
//!
//! Every decoded message enters through [`handle_message`] on a worker
//! thread. Messages from unauthenticated connections are gated off to the
//! auth state machine; authenticated slash commands resolve against the
//! public table, then the admin-only table, then the script bridge; plain
//! text is broadcast to the room.
//!
//! A handler returns the reply for the caller, or the empty string when it
//! has already sent whatever needed sending.

use crate::auth;
use crate::context::ServerContext;
use crate::ClientId;
use ember::logging;
use hashbrown::HashMap;

type Handler = fn(&ServerContext, ClientId, &[&str]) -> String;

/// The two disjoint command tables, built once at startup.
pub struct CommandTables {
    public: HashMap<&'static str, Handler>,
    admin: HashMap<&'static str, Handler>,
}

impl CommandTables {
    pub fn new() -> CommandTables {
        let mut public: HashMap<&'static str, Handler> = HashMap::new();
        public.insert("/list", cmd_list);
        public.insert("/whoami", cmd_whoami);
        public.insert("/w", cmd_whisper);
        public.insert("/help", cmd_help);
        public.insert("/quit", cmd_quit);
        public.insert("/create", cmd_create);
        public.insert("/join", cmd_join);
        public.insert("/send", cmd_send);
        public.insert("/listgroups", cmd_list_groups);
        public.insert("/leave", cmd_leave);
        public.insert("/groupkick", cmd_group_kick);
        public.insert("/groupunban", cmd_group_unban);
        public.insert("/transfer", cmd_transfer);

        let mut admin: HashMap<&'static str, Handler> = HashMap::new();
        admin.insert("/kick", cmd_kick);

        CommandTables { public, admin }
    }
}

impl Default for CommandTables {
    fn default() -> CommandTables {
        CommandTables::new()
    }
}

/// Entry point for every decoded message.
pub fn handle_message(ctx: &ServerContext, id: ClientId, payload: &str) {
    let nickname = match ctx.clients.nickname_of(id) {
        Some(nickname) => nickname,
        // The connection was torn down between decode and dispatch.
        None => return,
    };

    if nickname.is_empty() {
        let reply = auth::handle_message(ctx, id, payload);
        ctx.clients.send_to(id, &reply);
        return;
    }

    let trimmed = payload.trim();
    if trimmed.is_empty() {
        return;
    }

    if trimmed.starts_with('/') {
        let reply = dispatch_command(ctx, id, &nickname, trimmed);
        if !reply.is_empty() {
            ctx.clients.send_to(id, &reply);
        }
        return;
    }

    logging::info!(ctx.log, "chat"; "from" => nickname.as_str());
    ctx.clients
        .broadcast(&format!("{}: {}", nickname, payload), Some(id));
}

fn dispatch_command(ctx: &ServerContext, id: ClientId, nickname: &str, line: &str) -> String {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let mut command = tokens[0].to_lowercase();
    // "//x" is the escaped spelling of "/x".
    if command.starts_with("//") {
        command.remove(0);
    }
    let args = &tokens[1..];

    if let Some(handler) = ctx.commands.public.get(command.as_str()) {
        return handler(ctx, id, args);
    }

    if let Some(handler) = ctx.commands.admin.get(command.as_str()) {
        if ctx.clients.admin_flag(id) {
            return handler(ctx, id, args);
        }
        return "错误：权限不足，无法执行此命令。".to_string();
    }

    if ctx.scripts.dispatch(nickname, &command, args) {
        return String::new();
    }

    format!("错误：未知命令 '{}'。输入 /help 查看可用命令。", command)
}

fn caller_nickname(ctx: &ServerContext, id: ClientId) -> String {
    ctx.clients.nickname_of(id).unwrap_or_default()
}

fn cmd_list(ctx: &ServerContext, _id: ClientId, _args: &[&str]) -> String {
    let mut entries = ctx.clients.named_snapshot();
    entries.sort_by_key(|(id, _)| *id);

    let mut reply = String::from("在线用户：");
    for (id, nickname) in entries {
        reply.push_str(&format!("\n[{}] {}", id, nickname));
    }
    reply
}

fn cmd_whoami(ctx: &ServerContext, id: ClientId, _args: &[&str]) -> String {
    format!("您的昵称是 {}。", caller_nickname(ctx, id))
}

fn cmd_whisper(ctx: &ServerContext, id: ClientId, args: &[&str]) -> String {
    if args.len() < 2 {
        return "错误：参数不正确。用法: /w <昵称> <消息>".to_string();
    }

    let target = args[0];
    let sender = caller_nickname(ctx, id);
    if target == sender {
        return "错误：不能给自己发送私聊消息。".to_string();
    }

    let target_id = match ctx.clients.find_by_raw_nickname(target) {
        Some(target_id) => target_id,
        None => return format!("错误：用户 '{}' 不在线。", target),
    };

    let text = args[1..].join(" ");
    ctx.clients
        .send_to(target_id, &format!("来自 {} 的私聊：{}", sender, text));
    format!("已向 {} 发送私聊消息。", target)
}

fn cmd_help(ctx: &ServerContext, id: ClientId, _args: &[&str]) -> String {
    let mut help = String::from(
        "可用命令：\n\
         /list — 查看在线用户\n\
         /whoami — 查看自己的昵称\n\
         /w <昵称> <消息> — 发送私聊\n\
         /create <群名> [密码] — 创建群组\n\
         /join <群名> [密码] — 加入群组\n\
         /send <群名> <消息> — 向群组发言\n\
         /listgroups — 查看所有群组\n\
         /leave <群名> — 退出群组\n\
         /groupkick <群名> <昵称> — 将成员踢出群组（群主）\n\
         /groupunban <群名> <昵称> — 解除禁止（群主）\n\
         /transfer <群名> <昵称> — 转让群主（群主）\n\
         /quit — 退出聊天室",
    );
    if ctx.clients.admin_flag(id) {
        help.push_str("\n管理员命令：\n/kick <昵称> — 将用户踢出服务器");
    }
    help
}

fn cmd_quit(ctx: &ServerContext, id: ClientId, _args: &[&str]) -> String {
    ctx.clients.send_to(id, "再见！");
    ctx.disconnect_client(id);
    String::new()
}

fn cmd_create(ctx: &ServerContext, id: ClientId, args: &[&str]) -> String {
    ctx.groups.create(&caller_nickname(ctx, id), args)
}

fn cmd_join(ctx: &ServerContext, id: ClientId, args: &[&str]) -> String {
    ctx.groups.join(&caller_nickname(ctx, id), args)
}

fn cmd_send(ctx: &ServerContext, id: ClientId, args: &[&str]) -> String {
    ctx.groups.send(&caller_nickname(ctx, id), args)
}

fn cmd_list_groups(ctx: &ServerContext, _id: ClientId, _args: &[&str]) -> String {
    ctx.groups.list()
}

fn cmd_leave(ctx: &ServerContext, id: ClientId, args: &[&str]) -> String {
    ctx.groups.leave(&caller_nickname(ctx, id), args)
}

fn cmd_group_kick(ctx: &ServerContext, id: ClientId, args: &[&str]) -> String {
    ctx.groups.group_kick(&caller_nickname(ctx, id), args)
}

fn cmd_group_unban(ctx: &ServerContext, id: ClientId, args: &[&str]) -> String {
    ctx.groups.group_unban(&caller_nickname(ctx, id), args)
}

fn cmd_transfer(ctx: &ServerContext, id: ClientId, args: &[&str]) -> String {
    ctx.groups.transfer(&caller_nickname(ctx, id), args)
}

fn cmd_kick(ctx: &ServerContext, id: ClientId, args: &[&str]) -> String {
    if args.is_empty() {
        return "错误：参数不正确。用法: /kick <昵称>".to_string();
    }

    let target = args[0];
    let admin = caller_nickname(ctx, id);

    let target_id = match ctx.clients.find_by_raw_nickname(target) {
        Some(target_id) => target_id,
        None => return format!("错误：用户 '{}' 不在线。", target),
    };

    logging::info!(ctx.log, "admin kick"; "admin" => admin.as_str(), "target" => target);
    ctx.clients.broadcast(
        &format!("系统：用户 [{}] 已被管理员 [{}] 踢出聊天室。", target, admin),
        Some(target_id),
    );
    ctx.clients.send_to(target_id, "您已被管理员踢出聊天室。");
    ctx.disconnect_client(target_id);
    String::new()
}
