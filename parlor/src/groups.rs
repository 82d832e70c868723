//! Persistent named group conversations.
//!
//! Groups and their member/ban sets are keyed by lowercased nicknames; the
//! raw forms are kept for display. Every mutating operation runs point-in-
//! time under the group-manager mutex; broadcast target sets are snapshotted
//! inside that critical section and the fan-out happens after the mutex is
//! released, so the connection-table lock is never taken while the group
//! lock is held.
//!
//! Standing invariants, for every group that exists:
//!   - the owner is a member
//!   - the member set and the banned set are disjoint
//!   - the password hash is empty (public group) or a valid encoded
//!     Argon2id string

use crate::net::registry::ClientRegistry;
use ember::logging::{self, Logger};
use ember::passwd;
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A named, possibly password-protected membership set with an owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Display name (raw form).
    pub name: String,
    /// Lowercased nickname of the owner. The owner is always a member.
    pub owner: String,
    /// Lowercased member nicknames.
    pub members: HashSet<String>,
    /// Empty string means the group is public.
    #[serde(default)]
    pub password_hash: String,
    /// Lowercased nicknames barred from rejoining. Disjoint from `members`.
    #[serde(default)]
    pub banned: HashSet<String>,
}

/// Groups keyed by their lowercased name.
pub type GroupMap = HashMap<String, Group>;

/// One message fan-out computed under the group mutex and delivered after it
/// is released.
struct Outgoing {
    targets: Vec<String>,
    text: String,
}

pub struct GroupManager {
    groups: Mutex<GroupMap>,
    registry: Arc<ClientRegistry>,
    log: Logger,
}

impl GroupManager {
    pub fn new(initial: GroupMap, registry: Arc<ClientRegistry>, log: &Logger) -> GroupManager {
        GroupManager {
            groups: Mutex::new(initial),
            registry,
            log: log.new(logging::o!("mod" => "groups")),
        }
    }

    /// Clone the current group map, for the shutdown snapshot.
    pub fn snapshot(&self) -> GroupMap {
        self.groups.lock().clone()
    }

    fn deliver(&self, outgoing: Option<Outgoing>) {
        if let Some(outgoing) = outgoing {
            self.registry
                .send_to_lower_names(outgoing.targets.iter(), &outgoing.text);
        }
    }

    /// `/create <name> [password]`
    pub fn create(&self, creator_raw: &str, args: &[&str]) -> String {
        if args.is_empty() || args.len() > 2 {
            return "错误：参数不正确。用法: /create <群名> [密码]".to_string();
        }

        let name_raw = args[0];
        if name_raw.is_empty() {
            return "错误：群名不能为空。".to_string();
        }

        let lname = name_raw.to_lowercase();
        let creator = creator_raw.to_lowercase();
        let with_password = args.len() == 2;

        let password_hash = match args.get(1) {
            Some(password) => match passwd::hash_password(password) {
                Ok(hash) => hash,
                Err(err) => {
                    logging::error!(self.log, "group password hashing failed"; "error" => %err);
                    return "错误：设置群组密码失败，请稍后重试。".to_string();
                }
            },
            None => String::new(),
        };

        let mut groups = self.groups.lock();
        if groups.contains_key(&lname) {
            return format!("错误：群组 '{}' 已经存在。", name_raw);
        }

        let mut members = HashSet::new();
        members.insert(creator.clone());
        groups.insert(
            lname,
            Group {
                name: name_raw.to_string(),
                owner: creator,
                members,
                password_hash,
                banned: HashSet::new(),
            },
        );
        drop(groups);

        logging::info!(self.log, "group created";
                       "group" => name_raw, "owner" => creator_raw,
                       "protected" => with_password);

        if with_password {
            format!("恭喜！群组 '{}' 创建成功，已设置密码，您已自动成为群主。", name_raw)
        } else {
            format!("恭喜！群组 '{}' 创建成功，您已自动成为群主。", name_raw)
        }
    }

    /// `/join <name> [password]`
    pub fn join(&self, user_raw: &str, args: &[&str]) -> String {
        if args.is_empty() || args.len() > 2 {
            return "错误：参数不正确。用法: /join <群名> [密码]".to_string();
        }

        let lname = args[0].to_lowercase();
        let user = user_raw.to_lowercase();

        let mut groups = self.groups.lock();
        let group = match groups.get_mut(&lname) {
            Some(group) => group,
            None => return format!("错误：群组 '{}' 不存在。", args[0]),
        };

        if group.banned.contains(&user) {
            return format!("错误：您已被群组 '{}' 禁止重新加入。", group.name);
        }
        if group.members.contains(&user) {
            return "您已在该群组中。".to_string();
        }
        if !group.password_hash.is_empty() {
            match args.get(1) {
                None => {
                    return format!("错误：群组 '{}' 需要密码。用法: /join <群名> <密码>", group.name)
                }
                Some(password) if !passwd::verify_password(password, &group.password_hash) => {
                    return "错误：密码不正确。".to_string()
                }
                Some(_) => {}
            }
        }

        group.members.insert(user);
        let display = group.name.clone();
        drop(groups);

        logging::info!(self.log, "user joined group"; "group" => display.as_str(), "user" => user_raw);
        format!("成功加入群组 '{}'。", display)
    }

    /// `/send <name> <message…>` — fan the message out to every online
    /// member. Offline members are silently skipped. Returns the empty string
    /// on success: the message itself is the reply.
    pub fn send(&self, user_raw: &str, args: &[&str]) -> String {
        if args.len() < 2 {
            return "错误：参数不正确。用法: /send <群名> <消息>".to_string();
        }

        let lname = args[0].to_lowercase();
        let user = user_raw.to_lowercase();
        let text = args[1..].join(" ");

        let groups = self.groups.lock();
        let group = match groups.get(&lname) {
            Some(group) => group,
            None => return "错误：该群不存在。".to_string(),
        };
        if !group.members.contains(&user) {
            return "错误：您不是该群的成员。".to_string();
        }

        let outgoing = Outgoing {
            targets: group.members.iter().cloned().collect(),
            text: format!("[{}]{}: {}\n", group.name, user_raw, text),
        };
        drop(groups);

        self.deliver(Some(outgoing));
        String::new()
    }

    /// `/listgroups`
    pub fn list(&self) -> String {
        let groups = self.groups.lock();
        if groups.is_empty() {
            return "目前没有群。".to_string();
        }

        let mut names: Vec<&str> = groups.values().map(|group| group.name.as_str()).collect();
        names.sort_unstable();
        format!("所有群: {}", names.join(", "))
    }

    /// `/leave <name>` — leaving as owner hands the group to the
    /// lexicographically smallest other member, or dissolves it when no
    /// successor exists. Ownership-transfer broadcasts go to the surviving
    /// members; dissolution broadcasts go to the membership as it stood
    /// before the leave.
    pub fn leave(&self, user_raw: &str, args: &[&str]) -> String {
        if args.is_empty() {
            return "错误：参数不正确。用法: /leave <群名>".to_string();
        }

        let lname = args[0].to_lowercase();
        let user = user_raw.to_lowercase();

        let mut groups = self.groups.lock();
        let group = match groups.get_mut(&lname) {
            Some(group) => group,
            None => return format!("错误：群组 '{}' 不存在。", args[0]),
        };
        if !group.members.contains(&user) {
            return format!("错误：您不是群组 '{}' 的成员。", group.name);
        }

        let display = group.name.clone();
        let (reply, outgoing) = if group.owner != user {
            group.members.remove(&user);
            if group.members.is_empty() {
                let targets = vec![user.clone()];
                groups.remove(&lname);
                logging::info!(self.log, "group emptied and dissolved"; "group" => display.as_str());
                (
                    format!("您已成功退出群组 '{}'。", display),
                    Some(Outgoing {
                        targets,
                        text: format!("【系统】用户 [{}] 离开了群组 [{}]。", user_raw, display),
                    }),
                )
            } else {
                let targets = group.members.iter().cloned().collect();
                (
                    format!("您已成功退出群组 '{}'。", display),
                    Some(Outgoing {
                        targets,
                        text: format!("【系统】用户 [{}] 离开了群组 [{}]。", user_raw, display),
                    }),
                )
            }
        } else if group.members.len() > 1 {
            let successor = group
                .members
                .iter()
                .filter(|member| **member != user)
                .min()
                .cloned()
                .expect("a group with more than one member has a successor");
            group.owner = successor.clone();
            group.members.remove(&user);
            let targets = group.members.iter().cloned().collect();
            logging::info!(self.log, "group ownership passed on leave";
                           "group" => display.as_str(), "new_owner" => successor.as_str());
            (
                format!("您已成功退出群组 '{}'，群主已转让给 [{}]。", display, successor),
                Some(Outgoing {
                    targets,
                    text: format!(
                        "【系统】群主 [{}] 离开了群组 [{}]，群主已转让给 [{}]。",
                        user_raw, display, successor
                    ),
                }),
            )
        } else {
            let targets = group.members.iter().cloned().collect();
            groups.remove(&lname);
            logging::info!(self.log, "owner left, group dissolved"; "group" => display.as_str());
            (
                format!("您已成功退出群组 '{}'，群组已解散。", display),
                Some(Outgoing {
                    targets,
                    text: format!("【系统】群主 [{}] 离开了群组 [{}]。群组已解散。", user_raw, display),
                }),
            )
        };
        drop(groups);

        self.deliver(outgoing);
        reply
    }

    /// `/groupkick <name> <nick>` — owner only. The victim is removed from
    /// the member set and added to the banned set; the kick broadcast goes to
    /// the membership as it stood before the removal, victim included.
    pub fn group_kick(&self, caller_raw: &str, args: &[&str]) -> String {
        if args.len() != 2 {
            return "错误：参数不正确。用法: /groupkick <群名> <昵称>".to_string();
        }

        let lname = args[0].to_lowercase();
        let caller = caller_raw.to_lowercase();
        let victim_raw = args[1];
        let victim = victim_raw.to_lowercase();

        let mut groups = self.groups.lock();
        let group = match groups.get_mut(&lname) {
            Some(group) => group,
            None => return format!("错误：群组 '{}' 不存在。", args[0]),
        };
        if group.owner != caller {
            return format!("错误：您不是群组 '{}' 的群主，无权执行此操作。", group.name);
        }
        if victim == caller {
            return "错误：群主不能踢自己。".to_string();
        }
        if !group.members.contains(&victim) {
            return format!("错误：用户 '{}' 不是群组 '{}' 的成员。", victim_raw, group.name);
        }

        let display = group.name.clone();
        let targets: Vec<String> = group.members.iter().cloned().collect();
        group.members.remove(&victim);
        group.banned.insert(victim);
        if group.members.is_empty() {
            groups.remove(&lname);
        }
        drop(groups);

        logging::info!(self.log, "member kicked from group";
                       "group" => display.as_str(), "owner" => caller_raw, "victim" => victim_raw);
        self.deliver(Some(Outgoing {
            targets,
            text: format!(
                "【系统】用户 [{}] 已被群主 [{}] 踢出群组 [{}]。",
                victim_raw, caller_raw, display
            ),
        }));
        format!("已将用户 '{}' 踢出群组 '{}' 并加入禁止名单。", victim_raw, display)
    }

    /// `/groupunban <name> <nick>` — owner only.
    pub fn group_unban(&self, caller_raw: &str, args: &[&str]) -> String {
        if args.len() != 2 {
            return "错误：参数不正确。用法: /groupunban <群名> <昵称>".to_string();
        }

        let lname = args[0].to_lowercase();
        let caller = caller_raw.to_lowercase();
        let target_raw = args[1];
        let target = target_raw.to_lowercase();

        let mut groups = self.groups.lock();
        let group = match groups.get_mut(&lname) {
            Some(group) => group,
            None => return format!("错误：群组 '{}' 不存在。", args[0]),
        };
        if group.owner != caller {
            return format!("错误：您不是群组 '{}' 的群主，无权执行此操作。", group.name);
        }
        if !group.banned.remove(&target) {
            return format!("错误：用户 '{}' 不在禁止名单中。", target_raw);
        }

        let display = group.name.clone();
        let targets = group.members.iter().cloned().collect();
        drop(groups);

        logging::info!(self.log, "group ban lifted";
                       "group" => display.as_str(), "target" => target_raw);
        self.deliver(Some(Outgoing {
            targets,
            text: format!("【系统】用户 [{}] 已被解除群组 [{}] 的禁止。", target_raw, display),
        }));
        format!("已解除用户 '{}' 在群组 '{}' 的禁止。", target_raw, display)
    }

    /// `/transfer <name> <nick>` — owner only, target must be a member.
    pub fn transfer(&self, caller_raw: &str, args: &[&str]) -> String {
        if args.len() != 2 {
            return "错误：参数不正确。用法: /transfer <群名> <昵称>".to_string();
        }

        let lname = args[0].to_lowercase();
        let caller = caller_raw.to_lowercase();
        let target_raw = args[1];
        let target = target_raw.to_lowercase();

        let mut groups = self.groups.lock();
        let group = match groups.get_mut(&lname) {
            Some(group) => group,
            None => return format!("错误：群组 '{}' 不存在。", args[0]),
        };
        if group.owner != caller {
            return format!("错误：您不是群组 '{}' 的群主，无权执行此操作。", group.name);
        }
        if target == caller {
            return "错误：不能将群主转让给自己。".to_string();
        }
        if !group.members.contains(&target) {
            return format!("错误：用户 '{}' 不是群组 '{}' 的成员。", target_raw, group.name);
        }

        group.owner = target;
        let display = group.name.clone();
        let targets = group.members.iter().cloned().collect();
        drop(groups);

        logging::info!(self.log, "group ownership transferred";
                       "group" => display.as_str(), "from" => caller_raw, "to" => target_raw);
        self.deliver(Some(Outgoing {
            targets,
            text: format!(
                "【系统】群组 [{}] 的群主已由 [{}] 转让给 [{}]。",
                display, caller_raw, target_raw
            ),
        }));
        format!("已将群组 '{}' 的群主转让给 [{}]。", display, target_raw)
    }
}
