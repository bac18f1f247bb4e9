//! JSON shapes of i3/sway replies and events, and their conversion into
//! core types.

use crate::protocol::EventKind;
use crate::SwayError;
use i3pm_core::{
    CommandOp, CommandOutcome, EventWindow, ManagerCommand, ManagerEvent, WindowChange,
    WindowSnapshot, WorkspaceInfo,
};
use serde::Deserialize;

/// Name of the workspace that holds the scratchpad.
pub const SCRATCHPAD_WORKSPACE: &str = "__i3_scratch";

/// A node of the layout tree as returned by GET_TREE.
#[derive(Debug, Clone, Deserialize)]
pub struct Node {
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type", default)]
    pub node_type: String,
    #[serde(default)]
    pub num: Option<i32>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub floating_nodes: Vec<Node>,
    /// X11 window id (i3, XWayland).
    #[serde(default)]
    pub window: Option<u64>,
    /// Wayland app id (sway).
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub window_properties: Option<WindowProperties>,
    #[serde(default)]
    pub marks: Vec<String>,
    /// i3's floating state (`auto_on`, `user_off`, ...).
    #[serde(default)]
    pub floating: Option<String>,
}

/// X11 window properties.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WindowProperties {
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default)]
    pub instance: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

impl Node {
    /// Whether this node is an actual application window.
    pub fn is_view(&self) -> bool {
        self.nodes.is_empty()
            && self.floating_nodes.is_empty()
            && (self.window.is_some() || self.app_id.is_some())
    }

    /// Wayland app id, falling back to the X11 class.
    pub fn class(&self) -> String {
        self.app_id
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| {
                self.window_properties
                    .as_ref()
                    .and_then(|p| p.class.as_deref())
            })
            .unwrap_or_default()
            .to_string()
    }

    fn is_floating_flag(&self) -> bool {
        self.node_type == "floating_con"
            || self
                .floating
                .as_deref()
                .is_some_and(|f| f.ends_with("_on"))
    }
}

#[derive(Debug, Clone, Default)]
struct WorkspaceContext {
    num: Option<i32>,
    name: Option<String>,
    scratchpad: bool,
}

/// Flatten the tree into one snapshot per window.
pub fn flatten_tree(root: &Node) -> Vec<WindowSnapshot> {
    let mut out = Vec::new();
    walk(root, &WorkspaceContext::default(), false, &mut out);
    out
}

fn walk(node: &Node, ctx: &WorkspaceContext, in_floating: bool, out: &mut Vec<WindowSnapshot>) {
    let own_ctx;
    let ctx = if node.node_type == "workspace" {
        let name = node.name.clone();
        own_ctx = WorkspaceContext {
            num: node.num.filter(|n| *n > 0),
            scratchpad: name.as_deref() == Some(SCRATCHPAD_WORKSPACE),
            name,
        };
        &own_ctx
    } else {
        ctx
    };

    if node.is_view() {
        let floating = in_floating || node.is_floating_flag();
        out.push(WindowSnapshot {
            id: node.id,
            pid: node.pid,
            class: node.class(),
            title: node.name.clone().unwrap_or_default(),
            workspace_num: if ctx.scratchpad { None } else { ctx.num },
            workspace_name: ctx.name.clone(),
            floating,
            scratchpad: ctx.scratchpad,
            marks: node.marks.clone(),
        });
        return;
    }

    for child in &node.nodes {
        walk(child, ctx, in_floating, out);
    }
    for child in &node.floating_nodes {
        walk(child, ctx, true, out);
    }
}

/// A workspace as returned by GET_WORKSPACES.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkspaceJson {
    pub num: i32,
    pub name: String,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub visible: bool,
    #[serde(default)]
    pub focused: bool,
}

impl From<WorkspaceJson> for WorkspaceInfo {
    fn from(ws: WorkspaceJson) -> Self {
        WorkspaceInfo {
            num: ws.num,
            name: ws.name,
            output: ws.output,
            visible: ws.visible,
            focused: ws.focused,
        }
    }
}

/// Parse a GET_WORKSPACES reply.
pub fn parse_workspaces(payload: &[u8]) -> Result<Vec<WorkspaceInfo>, SwayError> {
    let workspaces: Vec<WorkspaceJson> = serde_json::from_slice(payload)?;
    Ok(workspaces.into_iter().map(WorkspaceInfo::from).collect())
}

/// Parse a GET_TREE reply into window snapshots.
pub fn parse_tree(payload: &[u8]) -> Result<Vec<WindowSnapshot>, SwayError> {
    let root: Node = serde_json::from_slice(payload)?;
    Ok(flatten_tree(&root))
}

/// One entry of a RUN_COMMAND reply.
#[derive(Debug, Clone, Deserialize)]
struct CommandReplyJson {
    success: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    parse_error: bool,
}

/// Parse a RUN_COMMAND reply, padding missing entries with failures so the
/// result always has `expected` outcomes.
pub fn parse_command_reply(payload: &[u8], expected: usize) -> Result<Vec<CommandOutcome>, SwayError> {
    let replies: Vec<CommandReplyJson> = serde_json::from_slice(payload)?;
    let mut outcomes: Vec<CommandOutcome> = replies
        .into_iter()
        .map(|r| {
            if r.success {
                CommandOutcome::ok()
            } else if r.parse_error {
                CommandOutcome::failed(format!(
                    "parse error: {}",
                    r.error.unwrap_or_default()
                ))
            } else {
                CommandOutcome::failed(r.error.unwrap_or_else(|| "command failed".to_string()))
            }
        })
        .collect();
    outcomes.truncate(expected);
    while outcomes.len() < expected {
        outcomes.push(CommandOutcome::failed("no reply for sub-command"));
    }
    Ok(outcomes)
}

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Render one sub-command in i3 command syntax.
pub fn render_command(cmd: &ManagerCommand) -> String {
    let criteria = format!("[con_id={}]", cmd.window_id);
    match &cmd.op {
        CommandOp::Mark(mark) => format!("{} mark --add {}", criteria, quote(mark)),
        CommandOp::Unmark(mark) => format!("{} unmark {}", criteria, quote(mark)),
        CommandOp::MoveToScratchpad => format!("{} move scratchpad", criteria),
        CommandOp::MoveToWorkspace(num) => {
            format!("{} move container to workspace number {}", criteria, num)
        }
        CommandOp::SetFloating(true) => format!("{} floating enable", criteria),
        CommandOp::SetFloating(false) => format!("{} floating disable", criteria),
    }
}

/// Render a batch as `;`-separated commands, one reply entry each.
pub fn render_batch(batch: &[ManagerCommand]) -> String {
    batch
        .iter()
        .map(render_command)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Deserialize)]
struct ChangeEventJson {
    #[serde(default)]
    change: String,
}

#[derive(Debug, Deserialize)]
struct WindowEventJson {
    change: String,
    container: Node,
}

#[derive(Debug, Deserialize)]
struct TickEventJson {
    #[serde(default)]
    first: bool,
    #[serde(default)]
    payload: String,
}

/// Decode an event payload. Returns `None` for kinds the daemon ignores.
pub fn parse_event(kind: EventKind, payload: &[u8]) -> Result<Option<ManagerEvent>, SwayError> {
    let event = match kind {
        EventKind::Window => {
            let ev: WindowEventJson = serde_json::from_slice(payload)?;
            let class = ev.container.class();
            ManagerEvent::Window {
                change: WindowChange::parse(&ev.change),
                window: EventWindow {
                    id: ev.container.id,
                    pid: ev.container.pid,
                    class,
                },
            }
        }
        EventKind::Workspace => {
            let ev: ChangeEventJson = serde_json::from_slice(payload)?;
            ManagerEvent::Workspace { change: ev.change }
        }
        EventKind::Output => {
            let ev: ChangeEventJson = serde_json::from_slice(payload)?;
            ManagerEvent::Output { change: ev.change }
        }
        EventKind::Shutdown => {
            let ev: ChangeEventJson = serde_json::from_slice(payload)?;
            ManagerEvent::Shutdown { change: ev.change }
        }
        EventKind::Tick => {
            let ev: TickEventJson = serde_json::from_slice(payload)?;
            ManagerEvent::Tick {
                payload: ev.payload,
                first: ev.first,
            }
        }
        EventKind::Mode | EventKind::BarconfigUpdate | EventKind::Binding => return Ok(None),
    };
    Ok(Some(event))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SWAY_TREE: &str = r#"{
        "id": 1, "type": "root", "name": "root",
        "nodes": [
            {"id": 2, "type": "output", "name": "__i3", "nodes": [
                {"id": 3, "type": "workspace", "name": "__i3_scratch", "num": -1,
                 "nodes": [],
                 "floating_nodes": [
                    {"id": 30, "type": "floating_con", "name": "hidden term",
                     "app_id": "Alacritty", "pid": 3000, "marks": ["_i3pm_hidden:30"],
                     "nodes": [], "floating_nodes": []}
                 ]}
            ]},
            {"id": 4, "type": "output", "name": "eDP-1", "nodes": [
                {"id": 5, "type": "workspace", "name": "2", "num": 2, "nodes": [
                    {"id": 10, "type": "con", "name": "code", "app_id": "code",
                     "pid": 1000, "marks": [], "nodes": [], "floating_nodes": []}
                 ], "floating_nodes": [
                    {"id": 11, "type": "floating_con", "name": "calc",
                     "app_id": "gnome-calculator", "pid": 1100,
                     "nodes": [], "floating_nodes": []}
                 ]},
                {"id": 6, "type": "workspace", "name": "web", "num": -1, "nodes": [
                    {"id": 12, "type": "con", "name": "firefox", "app_id": null,
                     "window": 4194307, "pid": 1200,
                     "window_properties": {"class": "firefox"},
                     "nodes": [], "floating_nodes": []}
                 ], "floating_nodes": []}
            ]}
        ],
        "floating_nodes": []
    }"#;

    // i3 wraps floating windows in a floating_con and omits pid.
    const I3_TREE: &str = r#"{
        "id": 1, "type": "root", "name": "root",
        "nodes": [
            {"id": 4, "type": "output", "name": "HDMI-1", "nodes": [
                {"id": 5, "type": "con", "name": "content", "nodes": [
                    {"id": 7, "type": "workspace", "name": "7", "num": 7,
                     "nodes": [],
                     "floating_nodes": [
                        {"id": 8, "type": "floating_con", "floating": "user_on", "nodes": [
                            {"id": 9, "type": "con", "name": "xterm", "window": 77,
                             "window_properties": {"class": "XTerm", "instance": "xterm"},
                             "floating": "user_on", "nodes": [], "floating_nodes": []}
                        ], "floating_nodes": []}
                     ]}
                ]}
            ]}
        ]
    }"#;

    fn snapshots(json: &str) -> Vec<WindowSnapshot> {
        parse_tree(json.as_bytes()).expect("tree should parse")
    }

    fn find(windows: &[WindowSnapshot], id: u64) -> &WindowSnapshot {
        windows.iter().find(|w| w.id == id).expect("window present")
    }

    #[test]
    fn test_flatten_sway_tree() {
        let windows = snapshots(SWAY_TREE);
        assert_eq!(windows.len(), 4);

        let code = find(&windows, 10);
        assert_eq!(code.workspace_num, Some(2));
        assert_eq!(code.pid, Some(1000));
        assert_eq!(code.class, "code");
        assert!(!code.floating);
        assert!(!code.scratchpad);

        let calc = find(&windows, 11);
        assert!(calc.floating);
        assert_eq!(calc.workspace_num, Some(2));
    }

    #[test]
    fn test_scratchpad_windows_have_no_workspace_number() {
        let windows = snapshots(SWAY_TREE);
        let hidden = find(&windows, 30);
        assert!(hidden.scratchpad);
        assert_eq!(hidden.workspace_num, None);
        assert!(hidden.is_hidden_by("_i3pm_hidden"));
    }

    #[test]
    fn test_named_workspace_and_x11_class() {
        let windows = snapshots(SWAY_TREE);
        let firefox = find(&windows, 12);
        assert_eq!(firefox.workspace_num, None);
        assert_eq!(firefox.workspace_name.as_deref(), Some("web"));
        assert_eq!(firefox.class, "firefox");
    }

    #[test]
    fn test_flatten_i3_tree() {
        let windows = snapshots(I3_TREE);
        assert_eq!(windows.len(), 1);
        let xterm = &windows[0];
        assert_eq!(xterm.id, 9);
        assert_eq!(xterm.pid, None);
        assert_eq!(xterm.class, "XTerm");
        assert_eq!(xterm.workspace_num, Some(7));
        assert!(xterm.floating);
    }

    #[test]
    fn test_parse_workspaces() {
        let json = r#"[
            {"num": 1, "name": "1", "output": "eDP-1", "visible": true, "focused": true},
            {"num": -1, "name": "web", "output": "eDP-1", "visible": false, "focused": false}
        ]"#;
        let workspaces = parse_workspaces(json.as_bytes()).unwrap();
        assert_eq!(workspaces.len(), 2);
        assert_eq!(workspaces[0].num, 1);
        assert!(workspaces[0].focused);
        assert_eq!(workspaces[1].name, "web");
    }

    #[test]
    fn test_render_commands() {
        let mark = ManagerCommand::new(5, CommandOp::Mark("_i3pm_hidden:5".into()));
        assert_eq!(render_command(&mark), r#"[con_id=5] mark --add "_i3pm_hidden:5""#);

        let batch = vec![
            ManagerCommand::new(5, CommandOp::MoveToScratchpad),
            ManagerCommand::new(6, CommandOp::MoveToWorkspace(7)),
            ManagerCommand::new(6, CommandOp::SetFloating(false)),
        ];
        assert_eq!(
            render_batch(&batch),
            "[con_id=5] move scratchpad; \
             [con_id=6] move container to workspace number 7; \
             [con_id=6] floating disable"
        );
    }

    #[test]
    fn test_quote_escapes() {
        let cmd = ManagerCommand::new(1, CommandOp::Unmark("a\"b".into()));
        assert_eq!(render_command(&cmd), r#"[con_id=1] unmark "a\"b""#);
    }

    #[test]
    fn test_command_reply_partial_failure() {
        let json = r#"[{"success":true},{"success":false,"error":"No matching window"}]"#;
        let outcomes = parse_command_reply(json.as_bytes(), 3).unwrap();
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].success);
        assert_eq!(outcomes[1].error.as_deref(), Some("No matching window"));
        assert!(!outcomes[2].success);
    }

    #[test]
    fn test_command_reply_parse_error() {
        let json = r#"[{"success":false,"parse_error":true,"error":"Expected one of"}]"#;
        let outcomes = parse_command_reply(json.as_bytes(), 1).unwrap();
        assert!(outcomes[0].error.as_deref().unwrap().starts_with("parse error"));
    }

    #[test]
    fn test_parse_window_event() {
        let json = r#"{"change":"move","container":{"id":10,"type":"con","app_id":"code","pid":1000,"nodes":[],"floating_nodes":[]}}"#;
        let event = parse_event(EventKind::Window, json.as_bytes()).unwrap();
        assert_eq!(
            event,
            Some(ManagerEvent::Window {
                change: WindowChange::Move,
                window: EventWindow {
                    id: 10,
                    pid: Some(1000),
                    class: "code".into()
                },
            })
        );
    }

    #[test]
    fn test_parse_tick_and_ignored_events() {
        let tick = parse_event(EventKind::Tick, br#"{"first":true,"payload":""}"#).unwrap();
        assert_eq!(
            tick,
            Some(ManagerEvent::Tick {
                payload: String::new(),
                first: true
            })
        );
        let mode = parse_event(EventKind::Mode, br#"{"change":"resize"}"#).unwrap();
        assert!(mode.is_none());
    }
}
