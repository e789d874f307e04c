use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};

use flowbot_core::types::ExecutionState;

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("placeholder pattern is valid")
    })
}

/// Values available to `{{name}}` placeholders in node text.
///
/// Captured execution variables shadow the built-ins (`phone`, `device`,
/// `name`, `stage`, `input`). Unknown placeholders are left as written.
pub struct TemplateContext<'a> {
    pub variables: &'a BTreeMap<String, String>,
    pub phone: &'a str,
    pub device: &'a str,
    pub display_name: Option<&'a str>,
    pub stage: Option<&'a str>,
    pub input: &'a str,
}

impl<'a> TemplateContext<'a> {
    pub fn for_execution(
        execution: &'a ExecutionState,
        display_name: Option<&'a str>,
        input: &'a str,
    ) -> Self {
        Self {
            variables: &execution.variables,
            phone: &execution.key.phone,
            device: &execution.key.device,
            display_name,
            stage: execution.stage.as_deref(),
            input,
        }
    }

    pub fn lookup(&self, name: &str) -> Option<&str> {
        if let Some(value) = self.variables.get(name) {
            return Some(value);
        }
        match name {
            "phone" => Some(self.phone),
            "device" => Some(self.device),
            "name" => self.display_name,
            "stage" => self.stage,
            "input" => Some(self.input),
            _ => None,
        }
    }

    pub fn render(&self, template: &str) -> String {
        if !template.contains("{{") {
            return template.to_string();
        }
        placeholder()
            .replace_all(template, |caps: &Captures<'_>| match self.lookup(&caps[1]) {
                Some(value) => value.to_string(),
                None => caps[0].to_string(),
            })
            .into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variables_and_builtins() {
        let mut variables = BTreeMap::new();
        variables.insert("budget".to_string(), "500".to_string());
        variables.insert("phone".to_string(), "masked".to_string());
        let ctx = TemplateContext {
            variables: &variables,
            phone: "628111",
            device: "dev-1",
            display_name: Some("Ana"),
            stage: None,
            input: "hi",
        };
        assert_eq!(
            ctx.render("Hi {{name}}, budget {{ budget }} from {{phone}} on {{device}}"),
            "Hi Ana, budget 500 from masked on dev-1"
        );
        assert_eq!(ctx.render("You said: {{input}}"), "You said: hi");
    }

    #[test]
    fn test_unknown_and_missing_placeholders_are_kept() {
        let variables = BTreeMap::new();
        let ctx = TemplateContext {
            variables: &variables,
            phone: "628111",
            device: "dev-1",
            display_name: None,
            stage: None,
            input: "",
        };
        assert_eq!(ctx.render("{{ nope }} / {{name}} / {{stage}}"), "{{ nope }} / {{name}} / {{stage}}");
        assert_eq!(ctx.render("no placeholders"), "no placeholders");
    }
}
