use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Display and prompting metadata for one agent role. Unknown roles at
/// compile time are resolved at runtime against this table, falling
/// back to a generic "role specialist" record rather than erroring.
#[derive(Debug, Clone)]
pub struct RoleRecord {
    pub role: String,
    pub display_name: String,
    pub prompt_prelude: String,
    pub default_tools: Vec<String>,
    pub default_model: Option<String>,
    pub color: String,
    pub icon: String,
}

fn builtin_roles() -> Vec<RoleRecord> {
    vec![
        RoleRecord {
            role: "developer".to_string(),
            display_name: "Developer (Primary)".to_string(),
            prompt_prelude: "You are a senior software engineer handling architecture decisions, complex implementations, and code quality.".to_string(),
            default_tools: vec!["Read", "Write", "Edit", "Bash", "Grep", "Glob"].into_iter().map(String::from).collect(),
            default_model: None,
            color: "#3b82f6".to_string(),
            icon: "Terminal".to_string(),
        },
        RoleRecord {
            role: "developer-2".to_string(),
            display_name: "Developer (Secondary)".to_string(),
            prompt_prelude: "You are a software engineer handling independent modules and parallel features without conflicts.".to_string(),
            default_tools: vec!["Read", "Write", "Edit", "Bash", "Grep", "Glob"].into_iter().map(String::from).collect(),
            default_model: None,
            color: "#06b6d4".to_string(),
            icon: "Code".to_string(),
        },
        RoleRecord {
            role: "tester".to_string(),
            display_name: "Tester".to_string(),
            prompt_prelude: "You are a QA engineer writing comprehensive tests, running test suites, and performing coverage analysis.".to_string(),
            default_tools: vec!["Read", "Bash", "Grep", "Glob"].into_iter().map(String::from).collect(),
            default_model: None,
            color: "#22c55e".to_string(),
            icon: "FlaskConical".to_string(),
        },
        RoleRecord {
            role: "security-reviewer".to_string(),
            display_name: "DevSecOps".to_string(),
            prompt_prelude: "You are a security engineer finding vulnerabilities, exposed secrets, and compliance gaps.".to_string(),
            default_tools: vec!["Read", "Bash", "Grep", "Glob"].into_iter().map(String::from).collect(),
            default_model: None,
            color: "#f97316".to_string(),
            icon: "Shield".to_string(),
        },
        RoleRecord {
            role: "report".to_string(),
            display_name: "Reporter".to_string(),
            prompt_prelude: "You summarize the work performed by the rest of the team into a final report.".to_string(),
            default_tools: vec!["Read", "Grep", "Glob"].into_iter().map(String::from).collect(),
            default_model: None,
            color: "#8b5cf6".to_string(),
            icon: "FileText".to_string(),
        },
    ]
}

fn unknown_role_record(role: &str) -> RoleRecord {
    RoleRecord {
        role: role.to_string(),
        display_name: "Role Specialist".to_string(),
        prompt_prelude: format!("You are a specialist handling the '{role}' role for this task."),
        default_tools: vec!["Read", "Bash", "Grep", "Glob"].into_iter().map(String::from).collect(),
        default_model: None,
        color: "#6b7280".to_string(),
        icon: "Bot".to_string(),
    }
}

/// User-extensible table mapping role names to display/prompt metadata.
#[derive(Clone)]
pub struct RoleRegistry {
    roles: Arc<RwLock<HashMap<String, RoleRecord>>>,
}

impl RoleRegistry {
    pub fn new() -> Self {
        let mut roles = HashMap::new();
        for record in builtin_roles() {
            roles.insert(record.role.clone(), record);
        }
        Self {
            roles: Arc::new(RwLock::new(roles)),
        }
    }

    /// Registers or overwrites a custom role at runtime.
    pub fn register(&self, record: RoleRecord) {
        self.roles
            .write()
            .expect("role registry lock poisoned")
            .insert(record.role.clone(), record);
    }

    /// Looks up a role, falling back to a generic specialist record
    /// for roles unknown at compile time and not registered at runtime.
    pub fn lookup(&self, role: &str) -> RoleRecord {
        self.roles
            .read()
            .expect("role registry lock poisoned")
            .get(role)
            .cloned()
            .unwrap_or_else(|| unknown_role_record(role))
    }
}

impl Default for RoleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_role_resolves_to_builtin_record() {
        let registry = RoleRegistry::new();
        let record = registry.lookup("developer");
        assert_eq!(record.color, "#3b82f6");
    }

    #[test]
    fn unknown_role_falls_back_without_erroring() {
        let registry = RoleRegistry::new();
        let record = registry.lookup("astrology-consultant");
        assert_eq!(record.display_name, "Role Specialist");
        assert_eq!(record.icon, "Bot");
    }

    #[test]
    fn runtime_registration_overrides_lookup() {
        let registry = RoleRegistry::new();
        registry.register(RoleRecord {
            role: "custom".to_string(),
            display_name: "Custom Role".to_string(),
            prompt_prelude: "You do custom things.".to_string(),
            default_tools: vec![],
            default_model: None,
            color: "#000000".to_string(),
            icon: "Star".to_string(),
        });
        let record = registry.lookup("custom");
        assert_eq!(record.display_name, "Custom Role");
    }
}
