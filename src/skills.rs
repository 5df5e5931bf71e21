use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Where a skill was discovered. Later sources shadow earlier ones by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SkillSource {
    Bundled,
    Local,
    Workspace,
}

/// A named, declarative capability description visible to the planner.
/// Not an executable plugin: only the description reaches the prompt.
#[derive(Debug, Clone, Serialize)]
pub struct Skill {
    pub id: String,
    pub name: String,
    pub description: String,
    pub source: SkillSource,
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct SkillLoader {
    /// (dir, source) pairs scanned in precedence order, lowest first.
    search_paths: Vec<(PathBuf, SkillSource)>,
}

impl SkillLoader {
    pub fn new(home: &Path, workspace: &Path) -> Self {
        let bundled = std::env::var("OPENPOCKET_TEMPLATE_DIR")
            .ok()
            .filter(|v| !v.is_empty())
            .map(|v| PathBuf::from(v).join("skills"))
            .or_else(|| {
                std::env::current_exe()
                    .ok()
                    .and_then(|exe| exe.parent().map(|p| p.join("skills")))
            });

        let mut search_paths = Vec::new();
        if let Some(dir) = bundled {
            search_paths.push((dir, SkillSource::Bundled));
        }
        search_paths.push((home.join("skills"), SkillSource::Local));
        search_paths.push((workspace.join("skills"), SkillSource::Workspace));
        Self { search_paths }
    }

    /// Enumerate `<dir>/<skill-id>/SKILL.md` entries across all sources,
    /// merging so that workspace shadows local shadows bundled.
    pub fn load(&self) -> Vec<Skill> {
        let mut merged: Vec<Skill> = Vec::new();
        for (dir, source) in &self.search_paths {
            for skill in scan_dir(dir, *source) {
                merged.retain(|existing| existing.id != skill.id);
                merged.push(skill);
            }
        }
        merged.sort_by(|a, b| a.id.cmp(&b.id));
        debug!("loaded {} skill(s)", merged.len());
        merged
    }

    /// One line per skill for the system prompt.
    pub fn catalog_text(&self) -> String {
        let skills = self.load();
        if skills.is_empty() {
            return String::new();
        }
        let mut out = String::from("Available skills:\n");
        for skill in &skills {
            out.push_str(&format!("- {}: {}\n", skill.name, skill.description));
        }
        out
    }
}

fn scan_dir(dir: &Path, source: SkillSource) -> Vec<Skill> {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return Vec::new(),
    };
    let mut skills = Vec::new();
    for entry in entries.flatten() {
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let skill_file = entry.path().join("SKILL.md");
        let content = match std::fs::read_to_string(&skill_file) {
            Ok(c) => c,
            Err(_) => continue,
        };
        let id = entry.file_name().to_string_lossy().to_string();
        let (name, description) = parse_skill_metadata(&content, &id);
        skills.push(Skill {
            id,
            name,
            description,
            source,
            path: skill_file.to_string_lossy().into_owned(),
        });
    }
    skills
}

/// Minimal metadata parse: a `---` frontmatter block with `name:` and
/// `description:` lines, else the first heading and first paragraph line.
fn parse_skill_metadata(content: &str, fallback_id: &str) -> (String, String) {
    let mut name = String::new();
    let mut description = String::new();

    if content.trim_start().starts_with("---") {
        let mut in_frontmatter = false;
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed == "---" {
                if in_frontmatter {
                    break;
                }
                in_frontmatter = true;
                continue;
            }
            if !in_frontmatter {
                continue;
            }
            if let Some(v) = trimmed.strip_prefix("name:") {
                name = v.trim().trim_matches('"').to_string();
            } else if let Some(v) = trimmed.strip_prefix("description:") {
                description = v.trim().trim_matches('"').to_string();
            }
        }
    }

    if name.is_empty() {
        name = content
            .lines()
            .find_map(|l| l.trim().strip_prefix("# ").map(str::to_string))
            .unwrap_or_else(|| fallback_id.to_string());
    }
    if description.is_empty() {
        description = content
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty() && !l.starts_with('#') && *l != "---" && !l.contains(':'))
            .unwrap_or("")
            .to_string();
    }
    (name, description)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_skill(root: &Path, id: &str, content: &str) {
        let dir = root.join(id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("SKILL.md"), content).unwrap();
    }

    #[test]
    fn test_parse_frontmatter() {
        let content = "---\nname: Send Message\ndescription: Sends a chat message\n---\nBody.";
        let (name, desc) = parse_skill_metadata(content, "send-message");
        assert_eq!(name, "Send Message");
        assert_eq!(desc, "Sends a chat message");
    }

    #[test]
    fn test_parse_heading_fallback() {
        let content = "# Open Camera\n\nOpens the camera app.\n";
        let (name, desc) = parse_skill_metadata(content, "open-camera");
        assert_eq!(name, "Open Camera");
        assert_eq!(desc, "Opens the camera app.");
    }

    #[test]
    fn test_workspace_shadows_local() {
        let tmp = tempfile::tempdir().unwrap();
        let home = tmp.path().join("home");
        let workspace = tmp.path().join("ws");
        write_skill(&home.join("skills"), "alarm", "# Alarm (local)\n\nLocal version.\n");
        write_skill(
            &workspace.join("skills"),
            "alarm",
            "# Alarm (workspace)\n\nWorkspace version.\n",
        );
        write_skill(&home.join("skills"), "timer", "# Timer\n\nSets a timer.\n");

        let loader = SkillLoader::new(&home, &workspace);
        let skills = loader.load();
        assert_eq!(skills.len(), 2);
        let alarm = skills.iter().find(|s| s.id == "alarm").unwrap();
        assert_eq!(alarm.name, "Alarm (workspace)");
        assert_eq!(alarm.source, SkillSource::Workspace);
        let timer = skills.iter().find(|s| s.id == "timer").unwrap();
        assert_eq!(timer.source, SkillSource::Local);
    }

    #[test]
    fn test_catalog_text() {
        let tmp = tempfile::tempdir().unwrap();
        let home = tmp.path().join("home");
        let workspace = tmp.path().join("ws");
        write_skill(&workspace.join("skills"), "timer", "# Timer\n\nSets a timer.\n");
        let loader = SkillLoader::new(&home, &workspace);
        let text = loader.catalog_text();
        assert!(text.contains("- Timer: Sets a timer."));
    }
}
