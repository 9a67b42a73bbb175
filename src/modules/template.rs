use anyhow::{anyhow, Context, Result};
use log::info;
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::{Path, PathBuf};

use crate::modules::copy::write_content;
use crate::modules::file::apply_attributes;
use crate::modules::param::get_string_param;
use crate::modules::{ModuleContext, ModuleExecutor, ModuleResult};
use crate::playbook::templar;

pub struct TemplateModule;

impl ModuleExecutor for TemplateModule {
    /// Render a Jinja-style template from `templates/` and write it to `dest`.
    fn execute(args: &Mapping, ctx: &ModuleContext) -> Result<ModuleResult> {
        let src = get_string_param(args, "src")
            .ok_or_else(|| anyhow!("Missing required parameter: src"))?;
        let dest = get_string_param(args, "dest")
            .ok_or_else(|| anyhow!("Missing required parameter: dest"))?;

        let src_path = match ctx.find_file("templates", &src) {
            Some(path) => path,
            None => return Ok(ModuleResult::failed(format!("Could not find or access '{}'", src))),
        };
        let source = fs::read_to_string(&src_path)
            .with_context(|| format!("Failed to read template file: {}", src_path.display()))?;

        info!("Rendering template: {} -> {}", src_path.display(), dest);
        let rendered = match templar::render_text(&source, ctx.vars) {
            Ok(text) => text,
            Err(e) => return Ok(ModuleResult::failed(format!("{}: {}", src, e))),
        };

        let dest_path = target_path(&dest, &src_path);
        let mut changed = write_content(&dest_path, rendered.as_bytes(), ctx)?;
        if dest_path.exists() {
            changed |= apply_attributes(&dest_path, args, ctx)?;
        }

        let mut result = if changed {
            ModuleResult::changed(format!("Template rendered to {}", dest_path.display()))
        } else {
            ModuleResult::ok(format!("{} is up to date", dest_path.display()))
        };
        result.data.insert(
            Value::String("dest".into()),
            Value::String(dest_path.display().to_string()),
        );
        result.data.insert(
            Value::String("src".into()),
            Value::String(src_path.display().to_string()),
        );
        Ok(result)
    }
}

/// A directory destination receives the template's name without `.j2`.
fn target_path(dest: &str, src_path: &Path) -> PathBuf {
    let dest_path = PathBuf::from(dest);
    if !(dest.ends_with('/') || dest_path.is_dir()) {
        return dest_path;
    }
    let name = src_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest_path.join(name.strip_suffix(".j2").unwrap_or(&name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{module_context, write_file};
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn args(yaml: &str) -> Mapping {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_template_renders_vars() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "templates/app.conf.j2",
            "listen {{ port }}\nroot {{ app_root }}\n{% for u in users %}user {{ u }}\n{% endfor %}",
        );
        let mut vars = HashMap::new();
        vars.insert("port".to_string(), Value::Number(8080.into()));
        vars.insert("base".to_string(), Value::String("/srv".into()));
        vars.insert("app_root".to_string(), Value::String("{{ base }}/app".into()));
        vars.insert("users".to_string(), serde_yaml::from_str("[ann, bob]").unwrap());
        let ctx = module_context(dir.path(), &vars);

        let a = args(&format!("{{src: app.conf.j2, dest: '{}/'}}", dir.path().display()));
        let result = TemplateModule::execute(&a, &ctx).unwrap();
        assert!(result.changed);
        assert_eq!(
            fs::read_to_string(dir.path().join("app.conf")).unwrap(),
            "listen 8080\nroot /srv/app\nuser ann\nuser bob\n"
        );
        assert!(!TemplateModule::execute(&a, &ctx).unwrap().changed);
    }

    #[test]
    fn test_template_undefined_variable_fails_task() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "templates/bad.j2", "{{ missing }}");
        let vars = HashMap::new();
        let ctx = module_context(dir.path(), &vars);
        let a = args(&format!("{{src: bad.j2, dest: '{}/out'}}", dir.path().display()));
        let result = TemplateModule::execute(&a, &ctx).unwrap();
        assert!(result.failed);
        assert!(!dir.path().join("out").exists());
    }

    #[test]
    fn test_target_path() {
        let dir = tempfile::tempdir().unwrap();
        let src = Path::new("/x/templates/motd.j2");
        assert_eq!(target_path("/etc/motd", src), PathBuf::from("/etc/motd"));
        let as_dir = format!("{}/", dir.path().display());
        assert_eq!(target_path(&as_dir, src), dir.path().join("motd"));
    }
}
