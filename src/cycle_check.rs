use std::collections::{BTreeMap, HashSet};
use crate::BoxTask;

/// Returns the first dependency cycle found, as the list of task names
/// along the cycle with the starting task repeated at the end.
pub fn find_cycle(tasks: &BTreeMap<String, BoxTask>) -> Option<Vec<String>> {
    let mut visited = HashSet::new();
    let mut stack: Vec<String> = Vec::new();

    fn dfs(
        task_name: &str,
        tasks: &BTreeMap<String, BoxTask>,
        visited: &mut HashSet<String>,
        stack: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        if let Some(pos) = stack.iter().position(|n| n == task_name) {
            let mut cycle = stack[pos..].to_vec();
            cycle.push(task_name.to_string());
            return Some(cycle);
        }
        if visited.contains(task_name) {
            return None;
        }

        visited.insert(task_name.to_string());
        stack.push(task_name.to_string());

        if let Some(task) = tasks.get(task_name) {
            for dep in task.dependencies() {
                if let Some(cycle) = dfs(&dep, tasks, visited, stack) {
                    return Some(cycle);
                }
            }
        }

        stack.pop();
        None
    }

    for task_name in tasks.keys() {
        if !visited.contains(task_name) {
            if let Some(cycle) = dfs(task_name, tasks, &mut visited, &mut stack) {
                return Some(cycle);
            }
        }
    }

    None
}
