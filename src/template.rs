//! Template engine for dynamic responses.
//!
//! Uses Handlebars to render string leaves of a response payload against the
//! incoming call. Numeric fields can be templated too: the codec accepts
//! decimal strings for every integer and float kind.

use crate::rule::Query;
use crate::value::{GenericValue, Payload};
use handlebars::{
    handlebars_helper, Context, Handlebars, Helper, HelperResult, Output, RenderContext,
};
use rand::Rng;
use serde::Serialize;
use std::collections::BTreeMap;

/// Template engine for rendering dynamic responses.
pub struct TemplateEngine {
    handlebars: Handlebars<'static>,
}

/// Context for template rendering.
#[derive(Debug, Serialize)]
pub struct TemplateContext {
    /// Decoded request message
    pub request: serde_json::Value,
    /// Filtered call headers
    pub headers: BTreeMap<String, String>,
    /// Fully-qualified service name
    pub service: String,
    /// Method name
    pub method: String,
}

impl TemplateContext {
    pub fn from_query(query: &Query) -> Self {
        Self {
            request: serde_json::Value::from(GenericValue::Map(query.payload.clone())),
            headers: query.headers.clone().unwrap_or_default(),
            service: query.service.clone(),
            method: query.method.clone(),
        }
    }
}

impl TemplateEngine {
    /// Create a new template engine.
    pub fn new() -> Self {
        let mut handlebars = Handlebars::new();

        handlebars.register_helper("json", Box::new(json_helper));
        handlebars.register_helper("uuid", Box::new(uuid_helper));
        handlebars.register_helper("now", Box::new(now_helper));
        handlebars.register_helper("random", Box::new(random_helper));
        handlebars.register_helper("default", Box::new(default_helper));
        handlebars.register_helper("upper", Box::new(upper_helper));
        handlebars.register_helper("lower", Box::new(lower_helper));

        // Output goes into protobuf fields, not HTML
        handlebars.register_escape_fn(handlebars::no_escape);

        Self { handlebars }
    }

    /// Render a single template string.
    pub fn render(
        &self,
        template: &str,
        ctx: &TemplateContext,
    ) -> Result<String, handlebars::RenderError> {
        self.handlebars.render_template(template, ctx)
    }

    /// Render every string leaf of `payload` that contains template syntax.
    pub fn render_payload(
        &self,
        payload: &Payload,
        ctx: &TemplateContext,
    ) -> Result<Payload, handlebars::RenderError> {
        payload
            .iter()
            .map(|(k, v)| Ok((k.clone(), self.render_value(v, ctx)?)))
            .collect()
    }

    fn render_value(
        &self,
        value: &GenericValue,
        ctx: &TemplateContext,
    ) -> Result<GenericValue, handlebars::RenderError> {
        match value {
            GenericValue::String(s) if s.contains("{{") => {
                Ok(GenericValue::String(self.render(s, ctx)?))
            }
            GenericValue::List(items) => items
                .iter()
                .map(|v| self.render_value(v, ctx))
                .collect::<Result<Vec<_>, _>>()
                .map(GenericValue::List),
            GenericValue::Map(map) => self.render_payload(map, ctx).map(GenericValue::Map),
            _ => Ok(value.clone()),
        }
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

handlebars_helper!(json_helper: |value: Json| serde_json::to_string(value).unwrap_or_default());

handlebars_helper!(upper_helper: |value: Json| {
    value.as_str().map(str::to_uppercase).unwrap_or_default()
});

handlebars_helper!(lower_helper: |value: Json| {
    value.as_str().map(str::to_lowercase).unwrap_or_default()
});

// Empty strings and missing values fall back; other scalars print as JSON.
handlebars_helper!(default_helper: |value: Json, fallback: str| match value {
    serde_json::Value::String(s) if !s.is_empty() => s.clone(),
    serde_json::Value::String(_) | serde_json::Value::Null => fallback.to_string(),
    other => other.to_string(),
});

/// `{{uuid}}`: random version 4 UUID.
fn uuid_helper(
    _: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let bytes: [u8; 16] = rand::random();
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    // Version and variant nibbles
    let uuid = format!(
        "{}-{}-4{}-{:x}{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[13..16],
        (bytes[8] & 0x3) | 0x8,
        &hex[17..20],
        &hex[20..32],
    );
    out.write(&uuid)?;
    Ok(())
}

/// `{{now}}` or `{{now "%s"}}`: current UTC time, chrono format.
fn now_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let format = h
        .param(0)
        .and_then(|p| p.value().as_str())
        .unwrap_or("%Y-%m-%dT%H:%M:%S%.3fZ");
    out.write(&chrono::Utc::now().format(format).to_string())?;
    Ok(())
}

/// `{{random min max}}`, inclusive, default `0..=100`.
fn random_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let bound = |i: usize, fallback: i64| {
        h.param(i)
            .and_then(|p| p.value().as_i64())
            .unwrap_or(fallback)
    };
    let (min, max) = (bound(0, 0), bound(1, 100));

    let value = if max > min {
        rand::thread_rng().gen_range(min..=max)
    } else {
        min
    };
    out.write(&value.to_string())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(request: serde_json::Value) -> TemplateContext {
        TemplateContext::from_query(&Query {
            service: "helloworld.Greeter".to_string(),
            method: "SayHello".to_string(),
            payload: GenericValue::from(request).into_map().unwrap(),
            headers: Some(BTreeMap::from([("tenant".to_string(), "abc".to_string())])),
        })
    }

    #[test]
    fn test_request_fields() {
        let engine = TemplateEngine::new();
        let result = engine
            .render("Hello {{request.name}}", &ctx(json!({"name": "world"})))
            .unwrap();
        assert_eq!(result, "Hello world");
    }

    #[test]
    fn test_headers_and_call_info() {
        let engine = TemplateEngine::new();
        let result = engine
            .render("{{method}} on {{service}} ({{headers.tenant}})", &ctx(json!({})))
            .unwrap();
        assert_eq!(result, "SayHello on helloworld.Greeter (abc)");
    }

    #[test]
    fn test_uuid_helper() {
        let engine = TemplateEngine::new();
        let result = engine.render("{{uuid}}", &ctx(json!({}))).unwrap();

        // xxxxxxxx-xxxx-4xxx-xxxx-xxxxxxxxxxxx
        assert_eq!(result.len(), 36);
        assert_eq!(result.chars().nth(8), Some('-'));
        assert_eq!(result.chars().nth(14), Some('4'));
    }

    #[test]
    fn test_default_helper() {
        let engine = TemplateEngine::new();
        let result = engine
            .render("{{default request.missing \"anon\"}}", &ctx(json!({})))
            .unwrap();
        assert_eq!(result, "anon");
    }

    #[test]
    fn test_upper_lower_helpers() {
        let engine = TemplateEngine::new();
        let result = engine
            .render(
                "{{upper request.name}} {{lower request.name}}",
                &ctx(json!({"name": "Ada"})),
            )
            .unwrap();
        assert_eq!(result, "ADA ada");
    }

    #[test]
    fn test_random_helper_bounds() {
        let engine = TemplateEngine::new();
        let result = engine.render("{{random 5 10}}", &ctx(json!({}))).unwrap();
        let n: i64 = result.parse().unwrap();
        assert!((5..=10).contains(&n));
    }

    #[test]
    fn test_render_payload() {
        let engine = TemplateEngine::new();
        let payload = GenericValue::from(json!({
            "reply": "Hi {{request.name}}",
            "echo": {"count": "{{request.count}}"},
            "tags": ["{{request.name}}", "static"],
            "fixed": 7
        }))
        .into_map()
        .unwrap();

        let rendered = engine
            .render_payload(&payload, &ctx(json!({"name": "ada", "count": 3})))
            .unwrap();

        assert_eq!(rendered["reply"], GenericValue::from("Hi ada"));
        assert_eq!(
            rendered["echo"].as_map().unwrap()["count"],
            GenericValue::from("3")
        );
        assert_eq!(
            rendered["tags"],
            GenericValue::List(vec!["ada".into(), "static".into()])
        );
        assert_eq!(rendered["fixed"], GenericValue::Int(7));
    }
}
