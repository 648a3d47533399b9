//! System prompt appended to every agent session.

use std::fmt::Write as _;
use std::path::Path;

use crate::relaunch;

/// Describe the project and the relaunch workflow to the agent.
pub fn build_system_prompt(project_directory: &Path) -> String {
    let name = project_directory
        .file_name()
        .map_or_else(|| "project".into(), |n| n.to_string_lossy());
    let script = relaunch::script_relative_path();
    let has_script = relaunch::script_path(project_directory).is_file();

    let mut prompt = String::new();
    let _ = writeln!(
        prompt,
        "You are working on the project \"{name}\" located at {}.",
        project_directory.display()
    );
    prompt.push_str(
        "The user may be following this session from another device, so keep \
         progress updates short and self-contained.\n\n",
    );
    prompt.push_str("## Relaunching the application\n");
    let _ = writeln!(
        prompt,
        "After changing code that affects the running application, rebuild and \
         restart it by running `{}` from the project root.",
        script.display()
    );
    prompt.push_str(
        "The script stops the running instance, builds the project and starts it \
         again. Check its output: a non-zero exit status means the build or the \
         restart failed, and the errors must be fixed before continuing.\n",
    );
    if !has_script {
        let _ = writeln!(
            prompt,
            "`{}` does not exist yet. Create it before the first relaunch if the \
             user asks for one.",
            script.display()
        );
    }
    prompt
}
