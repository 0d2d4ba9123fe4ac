//! In-memory key-value engine, command dispatcher, and persistence.
//!
//! A [`Store`] holds three independent namespaces (strings, lists, hashes)
//! plus an append-only journal of successful mutations. The whole body of one
//! [`Store::execute`] call is mutually exclusive with any other call on the
//! same store: one mutex guards the maps and the journal append, which gives
//! the replication log a single global order.
//!
//! Only the string map survives a restart: `flush` appends the journal to the
//! `log` file and rewrites the `dump` file, and `open` reloads `dump`. Lists
//! and hashes are ephemeral.

use std::collections::{BTreeMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{info, warn};

/// Append-only record of every mutation, one line per entry.
pub const LOG_FILE: &str = "log";
/// Snapshot of the string map, overwritten on every flush.
pub const DUMP_FILE: &str = "dump";

const NIL: &str = "<nil>";
const OK: &str = "OK";

pub struct Store {
    inner: Mutex<Inner>,
    log_path: PathBuf,
    dump_path: PathBuf,
}

#[derive(Default)]
struct Inner {
    strings: BTreeMap<String, String>,
    lists: BTreeMap<String, VecDeque<String>>,
    hashes: BTreeMap<String, BTreeMap<String, String>>,
    journal: Vec<Record>,
}

struct Record {
    request: String,
    timestamp: DateTime<Utc>,
}

enum ListEnd {
    Front,
    Back,
}

impl Store {
    /// Opens a store rooted at `dir`, reloading the string map from a `dump`
    /// file if one exists. Malformed dump lines are skipped with a warning.
    pub fn open(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        let store = Self {
            inner: Mutex::new(Inner::default()),
            log_path: dir.join(LOG_FILE),
            dump_path: dir.join(DUMP_FILE),
        };
        store.load_dump();
        store
    }

    fn load_dump(&self) {
        let Ok(file) = File::open(&self.dump_path) else {
            return;
        };
        let mut inner = self.inner.lock().unwrap();
        let mut loaded = 0usize;
        for line in BufReader::new(file).lines() {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    warn!(error = ?err, "failed to read dump file");
                    break;
                }
            };
            let Some((key, val)) = line.split_once(':') else {
                warn!(line = %line, "invalid database record");
                continue;
            };
            inner.strings.insert(key.to_string(), val.to_string());
            loaded += 1;
        }
        info!(entries = loaded, path = %self.dump_path.display(), "loaded dump");
    }

    /// Executes one command line and returns the reply text.
    pub fn execute(&self, request: &str) -> String {
        self.execute_tracked(request).0
    }

    /// Like [`Store::execute`], additionally reporting whether the request
    /// mutated the store (and was therefore journaled).
    pub fn execute_tracked(&self, request: &str) -> (String, bool) {
        let request = request.trim();
        if request.is_empty() {
            return (String::new(), false);
        }

        // Commands are case insensitive, but arguments are not.
        let tokens: Vec<&str> = request.split(' ').collect();
        let command = tokens[0].to_ascii_lowercase();
        let args = &tokens[1..];

        let mut inner = self.inner.lock().unwrap();
        let (reply, mutated) = match command.as_str() {
            "get" => (inner.get(args), false),
            "set" => inner.set(args),
            "incr" => inner.incr(args),
            "incrby" => inner.incrby(args),
            "decr" => inner.decr(args),
            "del" => inner.del(args),
            "lpush" => inner.push(args, "LPUSH", ListEnd::Front),
            "rpush" => inner.push(args, "RPUSH", ListEnd::Back),
            "lpop" => inner.pop(args, "LPOP", ListEnd::Front),
            "rpop" => inner.pop(args, "RPOP", ListEnd::Back),
            "llen" => (inner.llen(args), false),
            "lrange" => (inner.lrange(args), false),
            "hset" => inner.hset(args),
            "hget" => (inner.hget(args), false),
            "hlen" => (inner.hlen(args), false),
            "hkeys" => (inner.hkeys(args), false),
            "hvals" => (inner.hvals(args), false),
            "hgetall" => (inner.hgetall(args), false),
            _ => ("nop: no such function".to_string(), false),
        };
        if mutated {
            inner.journal.push(Record {
                request: request.to_string(),
                timestamp: Utc::now(),
            });
        }
        (reply, mutated)
    }

    /// Writes the journal to the log file and snapshots the string map to the
    /// dump file. The journal is drained on success so a second flush does
    /// not duplicate records.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        let mut log = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.log_path)
            .with_context(|| format!("failed to open {}", self.log_path.display()))?;
        for record in &inner.journal {
            writeln!(log, "\"{}\", {}", record.request, record.timestamp.to_rfc3339())?;
        }
        log.sync_all()?;

        let mut dump = File::create(&self.dump_path)
            .with_context(|| format!("failed to create {}", self.dump_path.display()))?;
        for (key, val) in &inner.strings {
            writeln!(dump, "{key}:{val}")?;
        }
        dump.sync_all()?;

        inner.journal.clear();
        Ok(())
    }
}

impl Inner {
    fn get(&self, args: &[&str]) -> String {
        if args.len() != 1 {
            return arity_error("GET", 1);
        }
        match self.strings.get(unquote(args[0])) {
            Some(val) => quoted(val),
            None => NIL.to_string(),
        }
    }

    fn set(&mut self, args: &[&str]) -> (String, bool) {
        if args.len() != 2 {
            return (arity_error("SET", 2), false);
        }
        let key = unquote(args[0]);
        let val = unquote(args[1]);
        self.strings.insert(key.to_string(), val.to_string());
        (OK.to_string(), true)
    }

    fn incr(&mut self, args: &[&str]) -> (String, bool) {
        if args.len() != 1 {
            return (arity_error("INCR", 1), false);
        }
        self.add_to(unquote(args[0]), 1, "INCR", "cannot increment non-integer string")
    }

    fn decr(&mut self, args: &[&str]) -> (String, bool) {
        if args.len() != 1 {
            return (arity_error("DECR", 1), false);
        }
        self.add_to(unquote(args[0]), -1, "DECR", "cannot decrement non-integer value")
    }

    fn incrby(&mut self, args: &[&str]) -> (String, bool) {
        if args.len() != 2 {
            return (arity_error("INCRBY", 2), false);
        }
        let Ok(delta) = args[1].parse::<i64>() else {
            return ("invalid integer argument".to_string(), false);
        };
        self.add_to(
            unquote(args[0]),
            delta,
            "INCRBY",
            "cannot increment non-integer value",
        )
    }

    fn add_to(&mut self, key: &str, delta: i64, cmd: &str, non_integer: &str) -> (String, bool) {
        let Some(val) = self.strings.get(key) else {
            return ("no such value in store".to_string(), false);
        };
        let Ok(int_val) = val.parse::<i64>() else {
            return (non_integer.to_string(), false);
        };
        let Some(result) = int_val.checked_add(delta) else {
            let kind = if delta < 0 { "underflow" } else { "overflow" };
            return (format!("unable to \"{cmd}\", integer {kind}"), false);
        };
        self.strings.insert(key.to_string(), result.to_string());
        (int_reply(result), true)
    }

    fn del(&mut self, args: &[&str]) -> (String, bool) {
        if args.len() != 1 {
            return (arity_error("DEL", 1), false);
        }
        let removed = self.strings.remove(unquote(args[0])).is_some();
        (OK.to_string(), removed)
    }

    fn push(&mut self, args: &[&str], cmd: &str, end: ListEnd) -> (String, bool) {
        if args.len() != 2 {
            return (arity_error(cmd, 2), false);
        }
        let name = unquote(args[0]);
        let item = unquote(args[1]).to_string();
        let list = self.lists.entry(name.to_string()).or_default();
        match end {
            ListEnd::Front => list.push_front(item),
            ListEnd::Back => list.push_back(item),
        }
        (int_reply(list.len() as i64), true)
    }

    fn pop(&mut self, args: &[&str], cmd: &str, end: ListEnd) -> (String, bool) {
        if args.len() != 1 {
            return (arity_error(cmd, 1), false);
        }
        let name = unquote(args[0]);
        let Some(list) = self.lists.get_mut(name) else {
            return (NIL.to_string(), false);
        };
        let item = match end {
            ListEnd::Front => list.pop_front(),
            ListEnd::Back => list.pop_back(),
        };
        // Empty lists are deleted rather than left behind.
        if list.is_empty() {
            self.lists.remove(name);
        }
        match item {
            Some(item) => (quoted(&item), true),
            None => (NIL.to_string(), false),
        }
    }

    fn llen(&self, args: &[&str]) -> String {
        if args.len() != 1 {
            return arity_error("LLEN", 1);
        }
        match self.lists.get(unquote(args[0])) {
            Some(list) => int_reply(list.len() as i64),
            None => int_reply(0),
        }
    }

    fn lrange(&self, args: &[&str]) -> String {
        if args.len() != 3 {
            return arity_error("LRANGE", 3);
        }
        let Some(list) = self.lists.get(unquote(args[0])) else {
            return "empty list".to_string();
        };
        let Ok(start) = args[1].parse::<i64>() else {
            return "invalid integer given as start index".to_string();
        };
        let Ok(stop) = args[2].parse::<i64>() else {
            return "invalid integer given as stop index".to_string();
        };
        // A negative stop means "read to the end of the list".
        let stop = if stop < 0 { list.len() as i64 } else { stop };
        if start < 0 {
            return "start index must be positive".to_string();
        }
        let items: Vec<String> = list
            .iter()
            .skip(start as usize)
            .take(stop.saturating_sub(start).max(0) as usize)
            .map(|item| quoted(item))
            .collect();
        if items.is_empty() {
            return "empty list".to_string();
        }
        items.join(", ")
    }

    fn hset(&mut self, args: &[&str]) -> (String, bool) {
        if args.len() != 3 {
            return (arity_error("HSET", 3), false);
        }
        let name = unquote(args[0]);
        let field = unquote(args[1]);
        let val = unquote(args[2]);
        let hash = self.hashes.entry(name.to_string()).or_default();
        let fresh = hash.insert(field.to_string(), val.to_string()).is_none();
        (int_reply(if fresh { 1 } else { 0 }), true)
    }

    fn hget(&self, args: &[&str]) -> String {
        if args.len() != 2 {
            return arity_error("HGET", 2);
        }
        let Some(hash) = self.hashes.get(unquote(args[0])) else {
            return NIL.to_string();
        };
        match hash.get(unquote(args[1])) {
            Some(val) => quoted(val),
            None => NIL.to_string(),
        }
    }

    fn hlen(&self, args: &[&str]) -> String {
        if args.len() != 1 {
            return arity_error("HLEN", 1);
        }
        match self.hashes.get(unquote(args[0])) {
            Some(hash) => hash.len().to_string(),
            None => int_reply(0),
        }
    }

    fn hkeys(&self, args: &[&str]) -> String {
        if args.len() != 1 {
            return arity_error("HKEYS", 1);
        }
        match self.hashes.get(unquote(args[0])) {
            Some(hash) => join_quoted(hash.keys()),
            None => "empty hash".to_string(),
        }
    }

    fn hvals(&self, args: &[&str]) -> String {
        if args.len() != 1 {
            return arity_error("HVALS", 1);
        }
        match self.hashes.get(unquote(args[0])) {
            Some(hash) => join_quoted(hash.values()),
            None => "empty hash".to_string(),
        }
    }

    fn hgetall(&self, args: &[&str]) -> String {
        if args.len() != 1 {
            return arity_error("HGETALL", 1);
        }
        match self.hashes.get(unquote(args[0])) {
            Some(hash) => join_quoted(hash.iter().map(|(field, val)| format!("{field}->{val}"))),
            None => "empty hash".to_string(),
        }
    }
}

/// Strips at most one leading and one trailing double quote, never interior
/// ones. An empty string after stripping is a valid key or value.
fn unquote(arg: &str) -> &str {
    let arg = arg.strip_prefix('"').unwrap_or(arg);
    arg.strip_suffix('"').unwrap_or(arg)
}

fn quoted(val: &str) -> String {
    format!("\"{val}\"")
}

fn int_reply(n: i64) -> String {
    format!("(int) {n}")
}

fn arity_error(cmd: &str, expected: usize) -> String {
    format!("wrong number of arguments for \"{cmd}\", expected {expected}")
}

fn join_quoted<I, S>(items: I) -> String
where
    I: Iterator<Item = S>,
    S: AsRef<str>,
{
    items
        .map(|item| quoted(item.as_ref()))
        .collect::<Vec<_>>()
        .join(", ")
}
