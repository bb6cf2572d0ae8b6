//! Scripted interpreter for driving the bridge without a WASM build.
//!
//! Fixture "datasets" are comma-separated text files; the interpreter
//! understands exactly the extraction expressions the bridge emits and
//! records every call so tests can check ordering and cleanup.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value};

use sasview_bridge::{
    BridgeConfig, BridgeError, Interpreter, InterpreterFactory, ObjectId, Result, RuntimeHandle,
};

/// Fixture with 3 rows and columns ID, VALUE.
pub const FIXTURE: &str = "ID,VALUE\n1,alpha\n2,beta\n3,NA\n";

/// Interpreter call log entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Install(Vec<String>),
    Mkdir(String),
    Mount(PathBuf),
    Unmount,
    Eval(String),
    Transfer(ObjectId),
    Destroy(ObjectId),
    Shutdown,
}

/// Shared view into every interpreter booted by a [`Recorder::factory`].
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
    /// Live object id -> owning interpreter.
    live: Mutex<BTreeMap<u32, usize>>,
    /// Interpreter -> mounted host directory.
    mounted: Mutex<BTreeMap<usize, PathBuf>>,
    next_id: AtomicUsize,
    pub boots: AtomicUsize,
    pub installs: AtomicUsize,
    pub fail_installs: AtomicUsize,
    pub fail_transfer: AtomicBool,
    pub fail_unmounts: AtomicUsize,
    pub garbage_output: AtomicBool,
    pub eval_delay_ms: AtomicU64,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Interpreter factory bound to this recorder.
    pub fn factory(self: &Arc<Self>) -> InterpreterFactory {
        let recorder = Arc::clone(self);
        Box::new(move |_: &BridgeConfig| -> Result<Box<dyn Interpreter>> {
            let instance = recorder.boots.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedInterpreter {
                recorder: Arc::clone(&recorder),
                instance,
                mounted: None,
                last_eval: None,
            }))
        })
    }

    /// Runtime handle using this recorder's interpreters.
    pub fn runtime(self: &Arc<Self>, config: BridgeConfig) -> RuntimeHandle {
        RuntimeHandle::new(config, self.factory())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn live_objects(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    pub fn mount_active(&self) -> bool {
        !self.mounted.lock().unwrap().is_empty()
    }

    pub fn set_eval_delay(&self, delay: Duration) {
        self.eval_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Mount/unmount events in order; `true` for mount.
    pub fn mount_sequence(&self) -> Vec<bool> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Mount(_) => Some(true),
                Event::Unmount => Some(false),
                _ => None,
            })
            .collect()
    }

    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

struct ScriptedInterpreter {
    recorder: Arc<Recorder>,
    instance: usize,
    mounted: Option<(String, PathBuf)>,
    last_eval: Option<String>,
}

impl ScriptedInterpreter {
    fn resolve(&self, virtual_path: &str) -> Option<PathBuf> {
        let (mount_point, host_dir) = self.mounted.as_ref()?;
        let rest = virtual_path.strip_prefix(mount_point.as_str())?;
        Some(host_dir.join(rest.trim_start_matches('/')))
    }

    fn run(&self, expr: &str) -> std::result::Result<Value, String> {
        let (reader, rest) = if let Some(i) = expr.find("haven::read_sas(\"") {
            ("sas7bdat", &expr[i + "haven::read_sas(\"".len()..])
        } else if let Some(i) = expr.find("haven::read_xpt(\"") {
            ("xpt", &expr[i + "haven::read_xpt(\"".len()..])
        } else {
            return Err(format!("could not find function in '{}'", expr));
        };

        let end = rest.find("\")").ok_or("unterminated string")?;
        let vpath = &rest[..end];
        let after = &rest[end + 2..];

        if !vpath.ends_with(reader) {
            return Err(format!("{} is not a {} file", vpath, reader));
        }
        let host = self
            .resolve(vpath)
            .ok_or_else(|| format!("cannot open file '{}': not mounted", vpath))?;
        let text = std::fs::read_to_string(&host)
            .map_err(|_| format!("cannot open file '{}': No such file or directory", vpath))?;
        let (columns, rows) = parse_fixture(&text);

        if expr.contains("dim(") {
            return Ok(Value::from(vec![rows.len() as u64, columns.len() as u64]));
        }

        let selectors = after
            .strip_prefix('[')
            .and_then(|s| s.split_once(']'))
            .map(|(inside, _)| inside)
            .ok_or("missing subset")?;
        let (row_sel, col_sel) = split_selectors(selectors)?;

        let row_range = select_rows(row_sel, rows.len())?;
        let col_idx = select_cols(col_sel, &columns)?;

        let records: Vec<Value> = rows[row_range]
            .iter()
            .map(|row| {
                let mut record = Map::new();
                for &c in &col_idx {
                    record.insert(columns[c].clone(), row[c].clone());
                }
                Value::Object(record)
            })
            .collect();
        Ok(Value::Array(records))
    }
}

fn parse_fixture(text: &str) -> (Vec<String>, Vec<Vec<Value>>) {
    let mut lines = text.lines().filter(|l| !l.is_empty());
    let columns = lines
        .next()
        .map(|h| h.split(',').map(str::to_string).collect())
        .unwrap_or_default();
    let rows = lines
        .map(|line| {
            line.split(',')
                .map(|cell| {
                    if cell == "NA" {
                        Value::Null
                    } else if let Ok(n) = cell.parse::<i64>() {
                        Value::from(n)
                    } else if let Ok(x) = cell.parse::<f64>() {
                        Value::from(x)
                    } else {
                        Value::from(cell)
                    }
                })
                .collect()
        })
        .collect();
    (columns, rows)
}

/// Split `rows, cols` at the first top-level comma.
fn split_selectors(s: &str) -> std::result::Result<(&str, &str), String> {
    let mut depth = 0;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => return Ok((s[..i].trim(), s[i + 1..].trim())),
            _ => {}
        }
    }
    Err(format!("incorrect number of dimensions in [{}]", s))
}

fn select_rows(sel: &str, n: usize) -> std::result::Result<std::ops::Range<usize>, String> {
    if sel == "TRUE" {
        return Ok(0..n);
    }
    let (a, b) = sel
        .split_once(':')
        .ok_or_else(|| format!("object '{}' not found", sel))?;
    let a: usize = a.trim().parse().map_err(|_| format!("bad row selector {}", sel))?;
    let b: usize = b.trim().parse().map_err(|_| format!("bad row selector {}", sel))?;
    if a == 0 || a > b {
        return Err(format!("bad row selector {}", sel));
    }
    Ok((a - 1).min(n)..b.min(n))
}

fn select_cols(sel: &str, columns: &[String]) -> std::result::Result<Vec<usize>, String> {
    if sel == "TRUE" {
        return Ok((0..columns.len()).collect());
    }
    let inner = sel
        .strip_prefix("c(")
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| format!("object '{}' not found", sel))?;
    inner
        .split(',')
        .map(|name| {
            let name = name.trim().trim_matches('"');
            columns
                .iter()
                .position(|c| c == name)
                .ok_or_else(|| format!("Can't subset columns that don't exist: `{}`", name))
        })
        .collect()
}

impl Interpreter for ScriptedInterpreter {
    fn install_packages(&mut self, packages: &[String], _repository: &str) -> Result<()> {
        self.recorder.installs.fetch_add(1, Ordering::SeqCst);
        self.recorder.record(Event::Install(packages.to_vec()));
        let pending = self.recorder.fail_installs.load(Ordering::SeqCst);
        if pending > 0 {
            self.recorder.fail_installs.store(pending - 1, Ordering::SeqCst);
            return Err(BridgeError::Interpreter(
                "package repository unreachable".to_string(),
            ));
        }
        Ok(())
    }

    fn mkdir(&mut self, path: &str) -> Result<()> {
        self.recorder.record(Event::Mkdir(path.to_string()));
        Ok(())
    }

    fn mount(&mut self, host_dir: &Path, mount_point: &str) -> Result<()> {
        self.recorder.record(Event::Mount(host_dir.to_path_buf()));
        let mut shared = self.recorder.mounted.lock().unwrap();
        let previous = shared.insert(self.instance, host_dir.to_path_buf());
        assert!(previous.is_none(), "overlapping mount of {:?}", host_dir);
        self.mounted = Some((mount_point.to_string(), host_dir.to_path_buf()));
        Ok(())
    }

    fn unmount(&mut self, _mount_point: &str) -> Result<()> {
        let pending = self.recorder.fail_unmounts.load(Ordering::SeqCst);
        if pending > 0 {
            self.recorder.fail_unmounts.store(pending - 1, Ordering::SeqCst);
            return Err(BridgeError::Interpreter("device busy".to_string()));
        }
        self.recorder.record(Event::Unmount);
        self.recorder.mounted.lock().unwrap().remove(&self.instance);
        self.mounted = None;
        Ok(())
    }

    fn mounted(&self, _mount_point: &str) -> Option<PathBuf> {
        self.mounted.as_ref().map(|(_, dir)| dir.clone())
    }

    fn eval(&mut self, expr: &str) -> Result<ObjectId> {
        self.recorder.record(Event::Eval(expr.to_string()));
        let delay = self.recorder.eval_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        self.run(expr).map_err(BridgeError::Evaluation)?;
        self.last_eval = Some(expr.to_string());
        let id = self.recorder.next_id.fetch_add(1, Ordering::SeqCst) as u32 + 1;
        self.recorder.live.lock().unwrap().insert(id, self.instance);
        Ok(ObjectId(id))
    }

    fn transfer(&mut self, id: ObjectId) -> Result<Vec<u8>> {
        self.recorder.record(Event::Transfer(id));
        if self.recorder.fail_transfer.load(Ordering::SeqCst) {
            return Err(BridgeError::Interpreter("transfer interrupted".to_string()));
        }
        if self.recorder.garbage_output.load(Ordering::SeqCst) {
            return Ok(b"<html>not json</html>".to_vec());
        }
        // Re-run the expression that produced this object.
        let expr = self
            .last_eval
            .clone()
            .ok_or_else(|| BridgeError::Interpreter(format!("unknown object {}", id)))?;
        let value = self.run(&expr).map_err(BridgeError::Evaluation)?;
        Ok(serde_json::to_vec(&value)?)
    }

    fn destroy(&mut self, id: ObjectId) -> Result<()> {
        self.recorder.record(Event::Destroy(id));
        let mut live = self.recorder.live.lock().unwrap();
        if live.get(&id.0) != Some(&self.instance) {
            return Err(BridgeError::Interpreter(format!("unknown object {}", id)));
        }
        live.remove(&id.0);
        Ok(())
    }

    fn shutdown(&mut self) {
        self.recorder.record(Event::Shutdown);
        self.recorder
            .live
            .lock()
            .unwrap()
            .retain(|_, owner| *owner != self.instance);
        self.recorder.mounted.lock().unwrap().remove(&self.instance);
    }
}

/// Write a fixture file into `dir` and return its absolute path.
pub fn write_fixture(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}
