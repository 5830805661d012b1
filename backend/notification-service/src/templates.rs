//! Notification templates and `{{variable}}` rendering.

use std::collections::HashMap;

use event_schema::events::templates as template_ids;

#[derive(Debug, Clone)]
pub struct Template {
    pub template_id: String,
    pub subject: String,
    pub body: String,
}

pub struct TemplateRegistry {
    templates: HashMap<String, Template>,
}

impl TemplateRegistry {
    /// Registry pre-loaded with the order workflow templates.
    pub fn with_defaults() -> Self {
        let mut templates = HashMap::new();
        for template in [
            Template {
                template_id: template_ids::ORDER_CONFIRMED.to_string(),
                subject: "Your order {{orderId}} is confirmed".to_string(),
                body: "Thank you for your purchase. Order {{orderId}} for {{totalAmount}} \
                       has been confirmed and is being prepared."
                    .to_string(),
            },
            Template {
                template_id: template_ids::ORDER_CANCELLED.to_string(),
                subject: "Your order {{orderId}} was cancelled".to_string(),
                body: "We are sorry: order {{orderId}} could not be completed. \
                       Reason: {{reason}}. Any charges have been refunded."
                    .to_string(),
            },
        ] {
            templates.insert(template.template_id.clone(), template);
        }
        Self { templates }
    }

    pub fn get(&self, template_id: &str) -> Option<&Template> {
        self.templates.get(template_id)
    }
}

/// Replace every `{{name}}` placeholder with its value. Unknown placeholders
/// are left in place so a missing variable is visible in the output.
pub fn render(text: &str, variables: &HashMap<String, String>) -> String {
    let mut out = text.to_string();
    for (name, value) in variables {
        out = out.replace(&format!("{{{{{name}}}}}"), value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_substitutes_variables() {
        let mut variables = HashMap::new();
        variables.insert("orderId".to_string(), "ord_1".to_string());
        variables.insert("reason".to_string(), "Out of stock".to_string());

        let rendered = render("Order {{orderId}}: {{reason}}", &variables);
        assert_eq!(rendered, "Order ord_1: Out of stock");
    }

    #[test]
    fn test_render_leaves_unknown_placeholders() {
        let rendered = render("Hello {{name}}", &HashMap::new());
        assert_eq!(rendered, "Hello {{name}}");
    }

    #[test]
    fn test_default_registry_has_workflow_templates() {
        let registry = TemplateRegistry::with_defaults();
        assert!(registry.get(template_ids::ORDER_CONFIRMED).is_some());
        assert!(registry.get(template_ids::ORDER_CANCELLED).is_some());
        assert!(registry.get("unknown-template").is_none());
    }
}
