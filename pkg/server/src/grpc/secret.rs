use std::sync::Arc;

use tonic::{Request, Response, Status};

use warren_control::Command;
use warren_proto::cluster::secret_service_server::SecretService;
use warren_proto::cluster::{
    CreateSecretRequest, DeleteSecretRequest, DeleteSecretResponse, GetSecretRequest, GetSecretValueRequest,
    ListSecretsRequest, ListSecretsResponse, Secret, SecretValue,
};

use crate::grpc::Ctx;
use crate::mapping::secret_to_pb;

pub struct SecretServiceImpl(pub Arc<Ctx>);

#[tonic::async_trait]
impl SecretService for SecretServiceImpl {
    async fn create(&self, request: Request<CreateSecretRequest>) -> Result<Response<Secret>, Status> {
        let req = request.into_inner();
        let plaintext = req.plaintext.clone();
        let ciphertext = self
            .0
            .secrets
            .encrypt(&plaintext)
            .map_err(|e| Status::internal(format!("encrypting secret: {e}")))?;
        let id = uuid::Uuid::new_v4().to_string();
        self.0.submit(Command::CreateSecret { id: id.clone(), name: req.name, data: ciphertext }).await?;
        let secret = self.0.store().get_secret(&id).ok_or_else(|| Status::internal("secret vanished after create"))?;
        // The caller just supplied the plaintext; echo it back rather than
        // re-decrypting, and never return ciphertext over the wire.
        Ok(Response::new(secret_to_pb(&secret, plaintext)))
    }

    /// Metadata only, same as `List`. Plaintext never crosses this call;
    /// a worker that needs a secret's value calls `GetValue` instead.
    async fn get(&self, request: Request<GetSecretRequest>) -> Result<Response<Secret>, Status> {
        let id = request.into_inner().id;
        let secret = self.0.store().get_secret(&id).ok_or_else(|| Status::not_found(format!("secret {id}")))?;
        Ok(Response::new(secret_to_pb(&secret, Vec::new())))
    }

    async fn list(&self, _request: Request<ListSecretsRequest>) -> Result<Response<ListSecretsResponse>, Status> {
        // Never decrypt every secret just to list names; callers that need
        // data must `GetValue` individually.
        let secrets = self.0.store().list_secrets().iter().map(|s| secret_to_pb(s, Vec::new())).collect();
        Ok(Response::new(ListSecretsResponse { secrets }))
    }

    async fn delete(&self, request: Request<DeleteSecretRequest>) -> Result<Response<DeleteSecretResponse>, Status> {
        let id = request.into_inner().id;
        self.0.submit(Command::DeleteSecret { id }).await?;
        Ok(Response::new(DeleteSecretResponse {}))
    }

    /// Only callable on behalf of a node that currently has a container
    /// assigned to it whose `secret_refs` names this secret; this is the
    /// one path plaintext is allowed to cross the wire on.
    async fn get_value(&self, request: Request<GetSecretValueRequest>) -> Result<Response<SecretValue>, Status> {
        let req = request.into_inner();
        let secret = self.0.store().get_secret(&req.id).ok_or_else(|| Status::not_found(format!("secret {}", req.id)))?;
        let authorized = self
            .0
            .store()
            .containers_for_node(&req.node_id)
            .iter()
            .any(|c| c.secret_refs.contains(&req.id));
        if !authorized {
            return Err(Status::permission_denied(format!(
                "node {} has no container referencing secret {}",
                req.node_id, req.id
            )));
        }
        let plaintext = self
            .0
            .secrets
            .decrypt(&secret.data)
            .map_err(|e| Status::internal(format!("decrypting secret: {e}")))?;
        Ok(Response::new(SecretValue { name: secret.name, plaintext }))
    }
}
