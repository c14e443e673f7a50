//! The Query/Command Surface: the operator-facing verbs dispatched by the
//! worker once a one-shot token has been verified.

use crate::config::{AgentPaths, Edition};
use crate::error::AgentError;
use crate::names::{validate_file_path_segment, validate_flag_identifier};
use crate::permission::{self, Scope, Verdict};
use crate::store;
use crate::target::{self, Target};

/// The flags a verb invocation may carry. Every field is optional at the
/// parse layer; each verb validates which of its own flags are required.
#[derive(Debug, Clone, Default)]
pub struct VerbArgs {
    /// `--incus`: the container a container-edition verb targets.
    pub incus: Option<String>,
    /// `--image`: the logical image name.
    pub image: Option<String>,
    /// `--revision`: a revision stem, for `revert`.
    pub revision: Option<String>,
    /// `--cmd`: an ad-hoc admin script name, for `exec`/`list-exec`.
    pub cmd: Option<String>,
}

/// Dispatch `verb` for `key_ref`, returning the verb's stdout text on
/// success or the wire-level [`AgentError`] on failure. Every verb has
/// already passed one-shot token verification by the time it reaches here.
pub fn dispatch(paths: &AgentPaths, key_ref: &str, verb: &str, args: &VerbArgs) -> Result<String, AgentError> {
    match verb {
        "edition" => Ok(paths.edition().as_str().to_string()),
        "last-deploy" => last_deploy(paths, key_ref, args),
        "last-deploy-blame" => last_deploy_blame(paths, key_ref, args),
        "list-revision" => list_revision(paths, key_ref, args),
        "list-image" => list_image(paths, key_ref, args),
        "list-incus" => list_incus(paths),
        "revert" => revert(paths, key_ref, args),
        "exec" => exec_cmd(paths, key_ref, args),
        "list-exec" => list_exec(paths, key_ref, args),
        "permission-json" => permission_json(paths, key_ref, args),
        other => Err(AgentError::CommandNotFound {
            message: format!("command '{other}' was not found"),
        }),
    }
}

fn require_image(args: &VerbArgs) -> Result<&str, AgentError> {
    let image = args.image.as_deref().ok_or_else(|| AgentError::Argument {
        message: "missing required --image flag".into(),
    })?;
    validate_flag_identifier(image)?;
    Ok(image)
}

/// Build the [`Target`] for this verb invocation: container edition
/// requires `--incus`; bare-metal ignores it. This collapses what would
/// otherwise be a whole duplicated verb table per edition into one
/// dispatch path.
fn build_target(paths: &AgentPaths, args: &VerbArgs) -> Result<Target, AgentError> {
    match paths.edition() {
        Edition::Container => {
            let name = args.incus.as_deref().ok_or_else(|| AgentError::Argument {
                message: "missing required --incus flag (container edition)".into(),
            })?;
            validate_flag_identifier(name)?;
            Ok(Target::Container(name.to_string()))
        }
        Edition::BareMetal => Ok(Target::Local),
    }
}

fn scope<'a>(target: &'a Target, image: &'a str) -> Scope<'a> {
    Scope {
        container: match target {
            Target::Container(name) => Some(name.as_str()),
            Target::Local => None,
        },
        image,
    }
}

fn require_permission(paths: &AgentPaths, key_ref: &str, scope: Scope<'_>, allowed: impl Fn(Verdict) -> bool, what: &str) -> Result<(), AgentError> {
    let verdict = permission::evaluate(paths, key_ref, scope);
    permission::require(verdict, allowed, what)
}

fn last_deploy(paths: &AgentPaths, key_ref: &str, args: &VerbArgs) -> Result<String, AgentError> {
    let image = require_image(args)?;
    let target = build_target(paths, args)?;
    require_permission(paths, key_ref, scope(&target, image), Verdict::allows_read, "read")?;

    store::current(paths, &target, image)
        .map_err(|e| AgentError::Argument {
            message: format!("could not resolve current revision for '{image}': {e}"),
        })?
        .ok_or_else(|| AgentError::Argument {
            message: format!("image '{image}' has no current revision"),
        })
}

fn last_deploy_blame(paths: &AgentPaths, key_ref: &str, args: &VerbArgs) -> Result<String, AgentError> {
    let image = require_image(args)?;
    let target = build_target(paths, args)?;
    require_permission(paths, key_ref, scope(&target, image), Verdict::allows_read, "read")?;

    let stem = store::current(paths, &target, image)
        .map_err(|e| AgentError::Argument {
            message: format!("could not resolve current revision for '{image}': {e}"),
        })?
        .ok_or_else(|| AgentError::Argument {
            message: format!("image '{image}' has no current revision"),
        })?;
    let blame_path = paths.image_dir(image).join(format!("{stem}.blame"));
    target.read_to_string(&blame_path).map_err(|e| AgentError::Argument {
        message: format!("could not read blame for '{stem}': {e}"),
    })
}

fn list_revision(paths: &AgentPaths, key_ref: &str, args: &VerbArgs) -> Result<String, AgentError> {
    let image = require_image(args)?;
    let target = build_target(paths, args)?;
    require_permission(paths, key_ref, scope(&target, image), Verdict::allows_read, "read")?;

    let revisions = store::list(paths, &target, image).map_err(|e| AgentError::Argument {
        message: format!("could not list revisions for '{image}': {e}"),
    })?;
    let lines: Vec<String> = revisions
        .iter()
        .map(|r| {
            if r.is_current {
                format!("{}   blame: {}     *CURRENT*", r.stem, r.blame)
            } else {
                format!("{}   blame: {}", r.stem, r.blame)
            }
        })
        .collect();
    Ok(lines.join("\n"))
}

fn list_image(paths: &AgentPaths, key_ref: &str, args: &VerbArgs) -> Result<String, AgentError> {
    let target = build_target(paths, args)?;
    // `list-image` has no single image in scope; evaluate the blanket
    // per-container permission by checking against an empty image name,
    // which only a full/read/admin grant (not a per-image `permit`) can
    // satisfy.
    require_permission(paths, key_ref, scope(&target, ""), Verdict::allows_read, "read")?;

    let images = store::list_images(paths, &target).map_err(|e| AgentError::Argument {
        message: format!("could not list images: {e}"),
    })?;
    Ok(images.join("\n"))
}

fn list_incus(paths: &AgentPaths) -> Result<String, AgentError> {
    if paths.edition() != Edition::Container {
        return Err(AgentError::CommandNotFound {
            message: "'list-incus' is only available in the container edition".into(),
        });
    }
    let mut names = target::list_incus_containers().map_err(|e| AgentError::Argument {
        message: format!("could not list containers: {e}"),
    })?;
    names.sort();
    Ok(names.join("\n"))
}

fn revert(paths: &AgentPaths, key_ref: &str, args: &VerbArgs) -> Result<String, AgentError> {
    let image = require_image(args)?;
    let revision = args.revision.as_deref().ok_or_else(|| AgentError::Argument {
        message: "missing required --revision flag".into(),
    })?;
    validate_file_path_segment(revision)?;
    let target = build_target(paths, args)?;
    require_permission(paths, key_ref, scope(&target, image), Verdict::allows_full, "full")?;

    let out = store::activate(paths, &target, image, revision)?;
    if !out.success() {
        return Err(AgentError::ExecFail {
            message: format!("activation script exited {}: {}", out.code, out.stderr),
        });
    }
    Ok(out.stdout)
}

fn exec_cmd(paths: &AgentPaths, key_ref: &str, args: &VerbArgs) -> Result<String, AgentError> {
    let cmd = args.cmd.as_deref().ok_or_else(|| AgentError::Argument {
        message: "missing required --cmd flag".into(),
    })?;
    validate_file_path_segment(cmd)?;
    let target = build_target(paths, args)?;
    require_permission(paths, key_ref, scope(&target, ""), Verdict::allows_admin, "admin")?;

    let path = paths.exec_script(cmd);
    if !target.exists(&path) {
        return Err(AgentError::ExecNotExist {
            message: format!("exec script '{path}' does not exist"),
        });
    }
    let out = target.run_script(&path).map_err(|e| AgentError::ExecFail {
        message: format!("failed to run '{path}': {e}"),
    })?;
    if !out.success() {
        return Err(AgentError::ExecFail {
            message: format!("'{cmd}' exited {}: {}", out.code, out.stderr),
        });
    }
    Ok(out.stdout)
}

fn list_exec(paths: &AgentPaths, key_ref: &str, args: &VerbArgs) -> Result<String, AgentError> {
    let target = build_target(paths, args)?;
    require_permission(paths, key_ref, scope(&target, ""), Verdict::allows_admin, "admin")?;

    let mut names = target.list_dir_names(&paths.exec_dir()).map_err(|e| AgentError::Argument {
        message: format!("could not list exec scripts: {e}"),
    })?;
    names.sort();
    Ok(names.join("\n"))
}

fn permission_json(paths: &AgentPaths, key_ref: &str, args: &VerbArgs) -> Result<String, AgentError> {
    let image = require_image(args)?;
    let target = build_target(paths, args)?;
    let snapshot = permission::describe(paths, key_ref, scope(&target, image));
    serde_json::to_string(&snapshot).map_err(|e| AgentError::Argument {
        message: format!("could not serialize permission snapshot: {e}"),
    })
}
