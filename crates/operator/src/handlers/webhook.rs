use actix_web::web::{Bytes, Data, Path};
use actix_web::{post, HttpRequest, HttpResponse, Responder};
use nopea_core::webhook::{
    parse_push_payload, valid_repo_name, verify_github_signature, verify_gitlab_token, Provider,
};
use nopea_core::worker::WorkerMsg;
use tracing::{info, warn};

use crate::server::AppState;

fn header<'a>(req: &'a HttpRequest, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

/// Push webhook ingress. Provider is detected from the event header, the
/// delivery is authenticated, and the repository's worker is told to sync.
#[post("/webhook/{repo}")]
pub async fn webhook(
    state: Data<AppState>,
    path: Path<String>,
    req: HttpRequest,
    body: Bytes,
) -> impl Responder {
    let repo = path.into_inner();
    if !valid_repo_name(&repo) {
        return HttpResponse::BadRequest().json("invalid repository name");
    }

    let github_event = header(&req, "X-GitHub-Event");
    let gitlab_event = header(&req, "X-Gitlab-Event");
    let Some(provider) = Provider::detect(github_event, gitlab_event) else {
        return HttpResponse::BadRequest().json("unknown webhook provider");
    };
    let count = |accepted: &str| {
        state
            .metrics
            .webhooks
            .with_label_values(&[provider.as_str(), accepted])
            .inc();
    };

    let Some(secret) = state.webhook_secret.as_deref() else {
        warn!(repo = %repo, "webhook received but no secret is configured");
        count("false");
        return HttpResponse::InternalServerError().json("webhook secret not configured");
    };

    let authentic = match provider {
        Provider::GitHub => header(&req, "X-Hub-Signature-256")
            .map(|sig| verify_github_signature(secret, sig, &body))
            .unwrap_or(false),
        Provider::GitLab => header(&req, "X-Gitlab-Token")
            .map(|token| verify_gitlab_token(secret, token))
            .unwrap_or(false),
    };
    if !authentic {
        warn!(repo = %repo, provider = provider.as_str(), "webhook signature rejected");
        count("false");
        return HttpResponse::Unauthorized().json("invalid signature");
    }

    let event = github_event.or(gitlab_event).unwrap_or_default();
    if !provider.is_push_event(event) {
        count("false");
        return HttpResponse::Ok().json("ignored");
    }

    let push = match parse_push_payload(&body) {
        Ok(push) => push,
        Err(reason) => {
            count("false");
            return HttpResponse::BadRequest().json(reason);
        }
    };

    let Some(worker) = state.supervisor.lookup(&repo) else {
        count("false");
        return HttpResponse::NotFound().json("no such repository");
    };
    info!(
        repo = %repo,
        provider = provider.as_str(),
        branch = push.branch.as_deref().unwrap_or(""),
        "webhook accepted"
    );
    count("true");
    worker.send(WorkerMsg::Webhook { commit: push.commit }).await;
    HttpResponse::Ok().json("accepted")
}
