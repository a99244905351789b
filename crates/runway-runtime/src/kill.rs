// Process-subtree termination. Two backends behind one function: Windows
// delegates to `taskkill /F /T`; elsewhere descendants are STOPped first so
// nothing can fork while the KILL pass walks the subtree.

use tokio::process::Command;

pub async fn kill_process_tree(pid: u32) {
    #[cfg(windows)]
    {
        kill_windows(pid).await;
    }
    #[cfg(not(windows))]
    {
        kill_posix(pid).await;
    }
}

#[cfg(windows)]
async fn kill_windows(pid: u32) {
    let result = Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .output()
        .await;
    if let Err(err) = result {
        tracing::warn!("taskkill for pid {pid} failed: {err}");
    }
}

#[cfg(not(windows))]
async fn kill_posix(root: u32) {
    // STOP the whole subtree, re-scan once to catch children forked while
    // the first pass ran, then KILL everything collected.
    let mut pids = collect_subtree(root);
    signal_all(&pids, "-STOP").await;
    let rescan = collect_subtree(root);
    if rescan.len() > pids.len() {
        signal_all(&rescan, "-STOP").await;
        pids = rescan;
    }
    signal_all(&pids, "-KILL").await;
}

#[cfg(not(windows))]
async fn signal_all(pids: &[u32], signal: &str) {
    for pid in pids {
        let _ = Command::new("kill")
            .arg(signal)
            .arg(pid.to_string())
            .output()
            .await;
    }
}

/// Root plus all transitive descendants, found by scanning /proc ppids.
/// The root comes last so children die before their parent can reap them.
#[cfg(not(windows))]
fn collect_subtree(root: u32) -> Vec<u32> {
    let mut children: std::collections::HashMap<u32, Vec<u32>> = std::collections::HashMap::new();
    if let Ok(entries) = std::fs::read_dir("/proc") {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(pid) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            let Some(ppid) = parent_pid(pid) else {
                continue;
            };
            children.entry(ppid).or_default().push(pid);
        }
    }

    let mut ordered = Vec::new();
    let mut stack = vec![root];
    while let Some(pid) = stack.pop() {
        if let Some(kids) = children.get(&pid) {
            stack.extend(kids.iter().copied());
        }
        ordered.push(pid);
    }
    ordered.reverse();
    ordered
}

#[cfg(not(windows))]
fn parent_pid(pid: u32) -> Option<u32> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // Format: pid (comm) state ppid ...; comm may contain spaces and
    // parens, so split after the last closing paren.
    let idx = stat.rfind(')')?;
    let mut fields = stat[idx + 1..].split_whitespace();
    let _state = fields.next()?;
    fields.next()?.parse().ok()
}

#[cfg(test)]
#[cfg(not(windows))]
mod tests {
    use super::*;

    #[test]
    fn own_process_has_a_parent() {
        let pid = std::process::id();
        assert!(parent_pid(pid).is_some());
    }

    #[test]
    fn subtree_contains_the_root_last() {
        let pid = std::process::id();
        let subtree = collect_subtree(pid);
        assert_eq!(subtree.last(), Some(&pid));
    }
}
