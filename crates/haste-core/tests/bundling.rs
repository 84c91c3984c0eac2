//! End-to-end bundling through the packager.

use haste_core::{BundleOptions, GlobalConfig, Packager, PackagerOptions};
use std::fs;
use std::path::Path;
use tempfile::tempdir;

/// `/proj/index.js` requires `./Foo` and the haste module `Bar`, which
/// lives in a package that is itself a watch root.
fn project(root: &Path) -> PackagerOptions {
    let lib = root.join("node_modules/libX");
    fs::create_dir_all(&lib).unwrap();
    fs::write(root.join("index.js"), "var Foo = require('./Foo');\nvar Bar = require('Bar');\nFoo(Bar);").unwrap();
    fs::write(root.join("Foo.js"), "module.exports = function(x) {\n  return x;\n};").unwrap();
    fs::write(lib.join("package.json"), r#"{"name": "libX"}"#).unwrap();
    fs::write(lib.join("Bar.js"), "/**\n * @providesModule Bar\n */\nmodule.exports = 'bar';").unwrap();
    PackagerOptions::new(vec![root.to_path_buf(), lib])
}

#[tokio::test]
async fn test_end_to_end_order_and_single_main_invocation() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let packager = Packager::new(project(root), GlobalConfig::default()).await.unwrap();
    let opts = BundleOptions::new("index.js");

    let paths = packager.get_ordered_dependency_paths(&opts).await.unwrap();
    assert_eq!(
        paths,
        vec![
            root.join("index.js"),
            root.join("Foo.js"),
            root.join("node_modules/libX/Bar.js"),
        ]
    );

    let bundle = packager.build_bundle(&opts).await.unwrap();
    let user: Vec<_> = bundle.modules()[bundle.num_prepended_modules()..].iter().collect();
    let registered: Vec<_> = user.iter().filter(|m| m.code.starts_with("__d(")).map(|m| m.name.as_str()).collect();
    assert_eq!(registered, vec!["index.js", "Foo.js", "Bar"]);

    let source = bundle.source(false);
    assert_eq!(source.matches("__d(").count(), 3);
    assert_eq!(source.matches("require(\"index.js\")").count(), 1);
    assert!(source.trim_end().ends_with(";require(\"index.js\");"));
    assert!(source.contains("require('Foo.js')"));
    assert!(source.contains("require('Bar')"));
}

#[tokio::test]
async fn test_source_map_sections_point_at_original_files() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let packager = Packager::new(project(root), GlobalConfig::default()).await.unwrap();

    let bundle = packager.build_bundle(&BundleOptions::new("index.js")).await.unwrap();
    let map = bundle.source_map();
    let sources: Vec<String> = map["sections"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["map"]["sources"][0].as_str().unwrap().to_string())
        .collect();
    let expected: Vec<String> = bundle
        .module_paths()
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    assert_eq!(sources, expected);
    assert_eq!(sources.len(), 3);
    assert_eq!(sources[0], root.join("index.js").to_string_lossy());

    // The first user line sits right under the wrapper header.
    let source = bundle.source(false);
    let offset = map["sections"][0]["offset"]["line"].as_u64().unwrap() as usize;
    assert_eq!(
        source.lines().nth(offset),
        Some("  var Foo = require('Foo.js');")
    );
}

#[tokio::test]
async fn test_entry_missing_from_roots() {
    let dir = tempdir().unwrap();
    let packager = Packager::new(project(dir.path()), GlobalConfig::default()).await.unwrap();

    let err = packager
        .build_bundle(&BundleOptions::new("nope.js"))
        .await
        .unwrap_err();
    let payload = err.to_payload();
    assert_eq!(payload.kind, "NotFoundError");
    assert_eq!(payload.filename.as_deref(), Some("nope.js"));
}
