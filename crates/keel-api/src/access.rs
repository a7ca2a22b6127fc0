//! Access gate: resolves an Application for a caller without leaking existence
//!
//! Resolution is a two-phase check. When the caller declares a project, the
//! declared RBAC path is checked first; a denial still performs the fetch so
//! that "no access" and "exists elsewhere" take the same time. After the
//! fetch, the authoritative check runs against the Application's *actual*
//! project.
//!
//! | Caller declared project? | Outcome on no access / missing / wrong project |
//! |--------------------------|-----------------------------------------------|
//! | no                       | `PermissionDenied` for all three              |
//! | yes                      | `PermissionDenied` on pre-check, else `NotFound` |

use std::future::Future;
use std::sync::Arc;

use keel_common::crd::{rbac_name, AppProject, Application};
use tracing::{error, warn};

use crate::error::{Error, Result};
use crate::rbac::{resources, PermissionOracle, UserIdentity};
use crate::store::ProjectStore;

/// Security classification attached to denial logs
pub const SECURITY_MEDIUM: &str = "medium";

/// Security classification for ignored client input
pub const SECURITY_LOW: &str = "low";

/// Authorizes callers against Applications and their projects
#[derive(Clone)]
pub struct AccessGate {
    oracle: Arc<dyn PermissionOracle>,
    projects: Arc<dyn ProjectStore>,
    control_namespace: String,
}

impl AccessGate {
    /// Create a gate for the given control namespace
    pub fn new(
        oracle: Arc<dyn PermissionOracle>,
        projects: Arc<dyn ProjectStore>,
        control_namespace: impl Into<String>,
    ) -> Self {
        Self {
            oracle,
            projects,
            control_namespace: control_namespace.into(),
        }
    }

    /// Control namespace used to build RBAC names
    pub fn control_namespace(&self) -> &str {
        &self.control_namespace
    }

    /// Whether the caller holds `action` on `object`
    pub async fn allowed(
        &self,
        caller: &UserIdentity,
        resource: &str,
        action: &str,
        object: &str,
    ) -> bool {
        self.oracle.enforce(caller, resource, action, object).await
    }

    /// Require `action` on `object`, failing with an opaque `PermissionDenied`
    pub async fn enforce(
        &self,
        caller: &UserIdentity,
        resource: &str,
        action: &str,
        object: &str,
    ) -> Result<()> {
        if self.allowed(caller, resource, action, object).await {
            Ok(())
        } else {
            Err(Error::PermissionDenied)
        }
    }

    /// Require `action` on an Application
    pub async fn enforce_app(
        &self,
        caller: &UserIdentity,
        action: &str,
        app: &Application,
    ) -> Result<()> {
        self.enforce(
            caller,
            resources::APPLICATIONS,
            action,
            &app.rbac_name(&self.control_namespace),
        )
        .await
    }

    /// Resolve an Application and its project for `caller`.
    ///
    /// `fetch` is invoked exactly once on every path, including early denial.
    pub async fn resolve<F, Fut>(
        &self,
        caller: &UserIdentity,
        action: &str,
        declared_project: &str,
        namespace: &str,
        name: &str,
        fetch: F,
    ) -> Result<(Application, AppProject)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Application>>,
    {
        if !declared_project.is_empty() {
            let given = rbac_name(&self.control_namespace, declared_project, namespace, name);
            if !self
                .allowed(caller, resources::APPLICATIONS, action, &given)
                .await
            {
                warn!(
                    user = %caller.username,
                    application = %name,
                    namespace = %namespace,
                    project = %declared_project,
                    security = SECURITY_MEDIUM,
                    "user tried to {action} application which they do not have access to"
                );
                let _ = fetch().await;
                return Err(Error::PermissionDenied);
            }
        }

        let app = match fetch().await {
            Ok(app) => app,
            Err(e) if e.is_not_found() => {
                if !declared_project.is_empty() {
                    return Err(Error::app_not_found(name));
                }
                warn!(user = %caller.username, application = %name, namespace = %namespace, "application does not exist");
                return Err(Error::PermissionDenied);
            }
            Err(e) => {
                error!(user = %caller.username, application = %name, namespace = %namespace, error = %e, "failed to get application");
                return Err(Error::PermissionDenied);
            }
        };

        if !self
            .allowed(
                caller,
                resources::APPLICATIONS,
                action,
                &app.rbac_name(&self.control_namespace),
            )
            .await
        {
            warn!(
                user = %caller.username,
                application = %name,
                namespace = %namespace,
                project = %app.spec.project,
                security = SECURITY_MEDIUM,
                "user tried to {action} application which they do not have access to"
            );
            return Err(if declared_project.is_empty() {
                Error::PermissionDenied
            } else {
                Error::app_not_found(name)
            });
        }

        let effective = app.effective_project();
        if !declared_project.is_empty() && effective != declared_project {
            warn!(
                user = %caller.username,
                application = %name,
                project = %app.spec.project,
                security = SECURITY_MEDIUM,
                "user tried to {action} application in project {declared_project}, but the application is in project {effective}"
            );
            return Err(Error::app_not_found(name));
        }

        let project = self.project_for(&app).await?;
        Ok((app, project))
    }

    /// Resolve the project an Application belongs to.
    ///
    /// A missing project and a project that does not admit the Application's
    /// namespace produce the same error.
    pub async fn project_for(&self, app: &Application) -> Result<AppProject> {
        let vague = || {
            Error::invalid(format!(
                "app is not allowed in project \"{}\", or the project does not exist",
                app.spec.project
            ))
        };

        let project = match self.projects.get(app.effective_project()).await {
            Ok(project) => project,
            Err(e) => {
                if !e.is_not_found() {
                    warn!(project = %app.spec.project, error = %e, "error getting app project");
                }
                return Err(vague());
            }
        };

        if !project.is_app_namespace_permitted(app.namespace(), &self.control_namespace) {
            warn!(
                project = %app.spec.project,
                namespace = %app.namespace(),
                security = SECURITY_MEDIUM,
                "application namespace is not permitted to use project"
            );
            return Err(vague());
        }

        Ok(project)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rbac::{actions, MockPermissionOracle};
    use crate::store::MockProjectStore;
    use crate::testing::{app_in, caller, project};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Oracle granting exactly the listed RBAC names for `get`
    fn oracle_granting(names: &'static [&'static str]) -> Arc<dyn PermissionOracle> {
        let mut oracle = MockPermissionOracle::new();
        oracle
            .expect_enforce()
            .returning(move |_, _, _, object| names.contains(&object));
        Arc::new(oracle)
    }

    fn projects() -> Arc<dyn ProjectStore> {
        let mut store = MockProjectStore::new();
        store.expect_get().returning(|name| match name {
            "p1" | "p2" | "default" => Ok(project(name)),
            _ => Err(Error::app_not_found(name)),
        });
        Arc::new(store)
    }

    fn gate(names: &'static [&'static str]) -> AccessGate {
        AccessGate::new(oracle_granting(names), projects(), "keel")
    }

    async fn resolve(
        gate: &AccessGate,
        declared: &str,
        existing: Option<Application>,
    ) -> Result<(Application, AppProject)> {
        gate.resolve(&caller("alice"), actions::GET, declared, "keel", "guestbook", || async move {
            existing.ok_or_else(|| Error::app_not_found("guestbook"))
        })
        .await
    }

    // ========================================================================
    // Story: no declared project never reveals existence
    // ========================================================================

    #[tokio::test]
    async fn undeclared_missing_app_is_permission_denied() {
        let err = resolve(&gate(&["p1/guestbook"]), "", None).await.unwrap_err();
        assert!(matches!(err, Error::PermissionDenied));
    }

    #[tokio::test]
    async fn undeclared_existing_app_without_access_is_permission_denied() {
        let err = resolve(&gate(&[]), "", Some(app_in("keel", "guestbook", "p1")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PermissionDenied));
    }

    #[tokio::test]
    async fn fetch_failures_are_permission_denied() {
        let err = gate(&["p1/guestbook"])
            .resolve(&caller("alice"), actions::GET, "", "keel", "guestbook", || async {
                Err(Error::upstream("kubernetes API", "timeout"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PermissionDenied));
    }

    // ========================================================================
    // Story: declared project
    // ========================================================================

    #[tokio::test]
    async fn declared_project_pre_check_denial_still_fetches() {
        let fetches = AtomicU32::new(0);
        let err = gate(&[])
            .resolve(&caller("alice"), actions::GET, "p1", "keel", "guestbook", || async {
                fetches.fetch_add(1, Ordering::SeqCst);
                Ok(app_in("keel", "guestbook", "p1"))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::PermissionDenied));
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn declared_project_missing_app_is_not_found() {
        let err = resolve(&gate(&["p1/guestbook"]), "p1", None).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn app_in_other_project_looks_like_missing_app() {
        // Caller may read p1/guestbook but the real app lives in p2
        let existing = Some(app_in("keel", "guestbook", "p2"));
        let wrong_project = resolve(&gate(&["p1/guestbook"]), "p1", existing)
            .await
            .unwrap_err();
        let missing = resolve(&gate(&["p1/guestbook"]), "p1", None)
            .await
            .unwrap_err();

        assert!(wrong_project.is_not_found());
        assert_eq!(wrong_project.to_string(), missing.to_string());
    }

    #[tokio::test]
    async fn accessible_app_in_other_project_is_not_found() {
        let existing = Some(app_in("keel", "guestbook", "p2"));
        let err = resolve(&gate(&["p1/guestbook", "p2/guestbook"]), "p1", existing)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn empty_project_resolves_as_default() {
        let existing = Some(app_in("keel", "guestbook", ""));
        let (app, project) = resolve(&gate(&["default/guestbook"]), "default", existing)
            .await
            .unwrap();
        assert_eq!(app.name(), "guestbook");
        assert_eq!(project.name(), "default");
    }

    // ========================================================================
    // Story: project resolution
    // ========================================================================

    #[tokio::test]
    async fn missing_project_is_vague_invalid_argument() {
        let existing = Some(app_in("keel", "guestbook", "ghost"));
        let err = resolve(&gate(&["ghost/guestbook"]), "", existing)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(
            err.to_string(),
            "app is not allowed in project \"ghost\", or the project does not exist"
        );
    }

    #[tokio::test]
    async fn namespace_outside_source_namespaces_is_vague_invalid_argument() {
        let existing = Some(app_in("team-a", "guestbook", "p1"));
        let err = gate(&["p1/team-a/guestbook"])
            .resolve(&caller("alice"), actions::GET, "", "team-a", "guestbook", || async move {
                existing.ok_or_else(|| Error::app_not_found("guestbook"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn authorized_caller_gets_app_and_project() {
        let existing = Some(app_in("keel", "guestbook", "p1"));
        let (app, project) = resolve(&gate(&["p1/guestbook"]), "p1", existing)
            .await
            .unwrap();
        assert_eq!(app.spec.project, "p1");
        assert_eq!(project.name(), "p1");
    }
}
