use haste_util::fs::{normalize, relative_slash};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

const REDIRECT_EXTS: [&str; 3] = ["", ".js", ".json"];

/// Outcome of asking a package whether a require should be redirected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redirect {
    Unchanged,
    To(String),
    /// Mapped to `false`: the dependency resolves to a null module.
    Suppressed,
}

/// One `package.json`.
#[derive(Debug)]
pub struct Package {
    pub path: PathBuf,
    pub root: PathBuf,
    json: OnceLock<Value>,
}

impl Package {
    pub(crate) fn new(path: PathBuf) -> Self {
        let root = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Self {
            path,
            root,
            json: OnceLock::new(),
        }
    }

    pub(crate) fn json_or_init(&self, read: impl FnOnce() -> Value) -> &Value {
        self.json.get_or_init(read)
    }

    pub(crate) fn json(&self) -> &Value {
        static EMPTY: Value = Value::Null;
        self.json.get().unwrap_or(&EMPTY)
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.json().get("name").and_then(Value::as_str)
    }

    /// The `react-native` field when present, otherwise `browser`.
    fn replacements(&self) -> Option<&Value> {
        let json = self.json();
        json.get("react-native").or_else(|| json.get("browser"))
    }

    fn replacement_map(&self) -> Option<&Map<String, Value>> {
        self.replacements().and_then(Value::as_object)
    }

    /// Absolute path of the package's main module, before extension
    /// completion.
    #[must_use]
    pub fn main(&self) -> PathBuf {
        if let Some(Value::String(main)) = self.replacements() {
            return normalize(&self.root.join(main));
        }

        let json = self.json();
        let mut main = json
            .get("main")
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
            .unwrap_or("index")
            .to_string();

        if let Some(map) = self.replacement_map() {
            let stripped = main
                .strip_suffix(".js")
                .or_else(|| main.strip_suffix(".json"))
                .unwrap_or(&main)
                .to_string();
            let bare = main.trim_start_matches("./").to_string();
            let candidates = [
                main.clone(),
                format!("{main}.js"),
                format!("{main}.json"),
                stripped.clone(),
                format!("./{bare}"),
                format!("./{bare}.js"),
                format!("./{}", stripped.trim_start_matches("./")),
            ];
            if let Some(replacement) = candidates
                .iter()
                .find_map(|key| map.get(key).and_then(Value::as_str))
            {
                main = replacement.to_string();
            }
        }

        normalize(&self.root.join(main))
    }

    /// Apply the replacement field to a require.
    ///
    /// Bare names are looked up directly. Absolute paths inside the package
    /// are looked up as `./relative` with `""`, `.js` and `.json` appended.
    #[must_use]
    pub fn redirect_require(&self, name: &str) -> Redirect {
        let Some(map) = self.replacement_map() else {
            return Redirect::Unchanged;
        };

        if !name.starts_with('/') {
            return match map.get(name) {
                Some(Value::Bool(false)) => Redirect::Suppressed,
                Some(Value::String(to)) if to != name => Redirect::To(to.clone()),
                _ => Redirect::Unchanged,
            };
        }

        let Some(rel) = relative_slash(&self.root, Path::new(name)) else {
            return Redirect::Unchanged;
        };
        let rel = format!("./{rel}");
        for ext in REDIRECT_EXTS {
            match map.get(&format!("{rel}{ext}")) {
                Some(Value::Bool(false)) => return Redirect::Suppressed,
                Some(Value::String(to)) => {
                    let target = normalize(&self.root.join(to));
                    return Redirect::To(target.to_string_lossy().into_owned());
                }
                _ => {}
            }
        }
        Redirect::Unchanged
    }
}
