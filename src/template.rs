//! Chat template formatting.
//!
//! A template descriptor bundles the jinja source with the stop strings the
//! template relies on for turn termination. Legacy templates without a
//! structured end token (vicuna, deepseek) declare their trigger strings
//! here; the session derives antiprompt token sequences from them at
//! template-init time, so turn termination is a property of the template
//! rather than a name comparison buried in the generation loop.

use minijinja::{context, Environment};
use serde::Serialize;

use crate::error::{Result, SessionError};

/// In-band marker the tokenizer replaces with image embeddings.
pub const IMAGE_MARKER: &str = "<__image__>";

/// One role-tagged turn. Ephemeral: built per generation call.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

struct BuiltinTemplate {
    name: &'static str,
    source: &'static str,
    stop_strings: &'static [&'static str],
}

const BUILTIN_TEMPLATES: &[BuiltinTemplate] = &[
    BuiltinTemplate {
        name: "chatml",
        source: "{% for message in messages %}<|im_start|>{{ message.role }}\n{{ message.content }}<|im_end|>\n{% endfor %}{% if add_generation_prompt %}<|im_start|>assistant\n{% endif %}",
        stop_strings: &[],
    },
    BuiltinTemplate {
        name: "llama3",
        source: "{% for message in messages %}<|start_header_id|>{{ message.role }}<|end_header_id|>\n\n{{ message.content }}<|eot_id|>{% endfor %}{% if add_generation_prompt %}<|start_header_id|>assistant<|end_header_id|>\n\n{% endif %}",
        stop_strings: &[],
    },
    BuiltinTemplate {
        name: "vicuna",
        source: "{% for message in messages %}{% if message.role == 'system' %}{{ message.content }}\n\n{% elif message.role == 'user' %}USER: {{ message.content }}\n{% else %}ASSISTANT: {{ message.content }}</s>\n{% endif %}{% endfor %}{% if add_generation_prompt %}ASSISTANT:{% endif %}",
        stop_strings: &["ASSISTANT:"],
    },
    BuiltinTemplate {
        name: "deepseek",
        source: "{% for message in messages %}{% if message.role == 'user' %}### Instruction:\n{{ message.content }}\n{% else %}### Response:\n{{ message.content }}\n{% endif %}{% endfor %}{% if add_generation_prompt %}### Response:\n{% endif %}",
        stop_strings: &["###"],
    },
];

/// A compiled chat template plus its declared stop strings.
pub struct ChatTemplates {
    env: Environment<'static>,
    name: &'static str,
    stop_strings: &'static [&'static str],
}

impl ChatTemplates {
    pub fn by_name(name: &str) -> Result<Self> {
        let builtin = BUILTIN_TEMPLATES
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| SessionError::UnknownTemplate(name.to_string()))?;

        let mut env = Environment::new();
        env.add_template(builtin.name, builtin.source)
            .map_err(|e| SessionError::TemplateInit(e.to_string()))?;

        Ok(Self {
            env,
            name: builtin.name,
            stop_strings: builtin.stop_strings,
        })
    }

    pub fn name(&self) -> &str {
        self.name
    }

    /// Stop strings this template depends on for turn termination. Empty
    /// for templates with a structured end token.
    pub fn stop_strings(&self) -> &'static [&'static str] {
        self.stop_strings
    }

    /// Render role-tagged messages into the exact prompt string the
    /// tokenizer consumes.
    pub fn render(&self, messages: &[ChatMessage], add_generation_prompt: bool) -> Result<String> {
        let template = self
            .env
            .get_template(self.name)
            .map_err(|e| SessionError::TemplateInit(e.to_string()))?;
        let rendered = template.render(context! {
            messages => messages,
            add_generation_prompt => add_generation_prompt,
        })?;
        Ok(rendered)
    }
}
