use foreman_core::types::Task;

/// Build the instruction text handed to the build command.
///
/// Lists the task context (module, priority, description, files, tags,
/// open subtasks, dependencies) followed by fixed working rules. Publishing
/// stays with the worker, so the build is told not to push.
pub fn build_instruction(task: &Task) -> String {
    let mut s = format!("## Roadmap Task: {}\n\n", task.title);

    if !task.category.is_empty() {
        s.push_str(&format!("**Module:** {}\n", task.category));
    }
    s.push_str(&format!("**Priority:** {}\n", task.priority));
    s.push_str(&format!("**Status:** {}\n", task.status));

    if !task.description.trim().is_empty() {
        s.push_str(&format!("\n### Description\n{}\n", task.description.trim()));
    }

    if !task.files_affected.is_empty() {
        s.push_str("\n### Files to look at / modify\n");
        for file in &task.files_affected {
            s.push_str(&format!("- {file}\n"));
        }
    }

    if !task.tags.is_empty() {
        s.push_str(&format!("\n**Tags:** {}\n", task.tags.join(", ")));
    }

    let pending: Vec<_> = task.pending_subtasks().collect();
    if !pending.is_empty() {
        s.push_str("\n### Subtasks\n");
        for sub in pending {
            s.push_str(&format!("- [ ] {}\n", sub.text));
        }
    }

    if !task.depends_on.is_empty() {
        s.push_str(&format!(
            "\n**Dependencies:** {}\n",
            task.depends_on.join(", ")
        ));
    }

    let commit_message = if task.category.is_empty() {
        task.title.clone()
    } else {
        format!("[{}] {}", task.category, task.title)
    };
    s.push_str(&format!(
        "\n### Instructions\n\
         1. Read the relevant files before making changes.\n\
         2. Implement the feature or fix described above.\n\
         3. Follow the existing code style and conventions.\n\
         4. Run the existing tests and make sure they pass.\n\
         5. Commit changes with message: {commit_message}\n\
         6. Do NOT push. The worker agent handles git push and PR creation.\n\
         \n\
         Work autonomously. Do not ask questions; make reasonable decisions.\n",
    ));
    s
}
