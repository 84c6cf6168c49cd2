//! Linear GraphQL client.
//!
//! Implements the tracker contracts over Linear's GraphQL API. GraphQL
//! schema errors are permanent (never retried); transport failures surface
//! as plain errors for the retrier.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{Comment, CommentClient, IssueFetcher, IssueQuery, IssueStateClient, TrackerIssue,
            WorkflowState};
use crate::retry::permanent;

const LINEAR_API_URL: &str = "https://api.linear.app/graphql";

pub struct LinearClient {
    http: reqwest::Client,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    errors: Option<Vec<GraphQlError>>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

impl LinearClient {
    pub fn new(api_key: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
        }
    }

    async fn execute(&self, query: &str, variables: Value) -> Result<Value> {
        let resp = self
            .http
            .post(LINEAR_API_URL)
            .header("Authorization", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .context("Failed to send request to Linear")?;

        let status = resp.status();
        if status.is_client_error() && status != reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(permanent(anyhow::anyhow!(
                "Linear API rejected the request: {}",
                status
            )));
        }
        let resp = resp
            .error_for_status()
            .context("Linear API returned error status")?;
        let body: GraphQlResponse = resp
            .json()
            .await
            .context("Failed to parse Linear response")?;

        if let Some(errors) = body.errors {
            let messages: Vec<String> = errors.into_iter().map(|e| e.message).collect();
            return Err(permanent(anyhow::anyhow!(
                "Linear GraphQL error: {}",
                messages.join("; ")
            )));
        }
        body.data
            .context("Linear response carried neither data nor errors")
    }
}

fn parse_comment(node: &Value) -> Option<Comment> {
    let user = node.get("user");
    Some(Comment {
        id: node.get("id")?.as_str()?.to_string(),
        body: node
            .get("body")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        author_name: user
            .and_then(|u| u.get("displayName"))
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
        author_is_bot: user
            .and_then(|u| u.get("isMe"))
            .and_then(Value::as_bool)
            .unwrap_or(false),
        parent_id: node
            .get("parent")
            .and_then(|p| p.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string),
        created_at: node
            .get("createdAt")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}

#[async_trait]
impl IssueFetcher for LinearClient {
    async fn list_assigned_issues(&self, query: &IssueQuery) -> Result<Vec<TrackerIssue>> {
        let mut filter = json!({
            "team": { "id": { "eq": query.team_id } },
            "assignee": { "id": { "eq": query.assignee_id } },
            "state": { "type": { "nin": ["completed", "canceled"] } },
        });
        if let Some(project_id) = &query.project_id {
            filter["project"] = json!({ "id": { "eq": project_id } });
        }
        if let Some(label) = &query.label {
            filter["labels"] = json!({ "name": { "eq": label } });
        }
        let data = self
            .execute(
                "query AssignedIssues($filter: IssueFilter!) {
                   issues(filter: $filter, first: 100) {
                     nodes { id identifier title description }
                   }
                 }",
                json!({ "filter": filter }),
            )
            .await?;

        let nodes = data["issues"]["nodes"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        Ok(nodes
            .iter()
            .filter_map(|n| {
                Some(TrackerIssue {
                    id: n.get("id")?.as_str()?.to_string(),
                    identifier: n
                        .get("identifier")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    title: n
                        .get("title")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    description: n
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                })
            })
            .collect())
    }
}

#[async_trait]
impl CommentClient for LinearClient {
    async fn list_comments(&self, issue_id: &str) -> Result<Vec<Comment>> {
        let data = self
            .execute(
                "query IssueComments($id: String!) {
                   issue(id: $id) {
                     comments(first: 250) {
                       nodes {
                         id body createdAt
                         user { displayName isMe }
                         parent { id }
                       }
                     }
                   }
                 }",
                json!({ "id": issue_id }),
            )
            .await?;
        let mut comments: Vec<Comment> = data["issue"]["comments"]["nodes"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .iter()
            .filter_map(parse_comment)
            .collect();
        // Linear returns newest-first; the protocol wants oldest-first.
        comments.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(comments)
    }

    async fn post_comment(&self, issue_id: &str, body: &str) -> Result<Comment> {
        let data = self
            .execute(
                "mutation PostComment($issueId: String!, $body: String!) {
                   commentCreate(input: { issueId: $issueId, body: $body }) {
                     comment {
                       id body createdAt
                       user { displayName isMe }
                       parent { id }
                     }
                   }
                 }",
                json!({ "issueId": issue_id, "body": body }),
            )
            .await?;
        parse_comment(&data["commentCreate"]["comment"])
            .context("Linear did not return the created comment")
    }

    async fn post_reply(&self, issue_id: &str, parent_id: &str, body: &str) -> Result<Comment> {
        let data = self
            .execute(
                "mutation PostReply($issueId: String!, $parentId: String!, $body: String!) {
                   commentCreate(input: { issueId: $issueId, parentId: $parentId, body: $body }) {
                     comment {
                       id body createdAt
                       user { displayName isMe }
                       parent { id }
                     }
                   }
                 }",
                json!({ "issueId": issue_id, "parentId": parent_id, "body": body }),
            )
            .await?;
        parse_comment(&data["commentCreate"]["comment"])
            .context("Linear did not return the created reply")
    }

    async fn react(&self, comment_id: &str, emoji: &str) -> Result<()> {
        self.execute(
            "mutation React($commentId: String!, $emoji: String!) {
               reactionCreate(input: { commentId: $commentId, emoji: $emoji }) {
                 success
               }
             }",
            json!({ "commentId": comment_id, "emoji": emoji }),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl IssueStateClient for LinearClient {
    async fn list_workflow_states(&self, team_id: &str) -> Result<Vec<WorkflowState>> {
        let data = self
            .execute(
                "query WorkflowStates($teamId: ID!) {
                   workflowStates(filter: { team: { id: { eq: $teamId } } }, first: 50) {
                     nodes { id name }
                   }
                 }",
                json!({ "teamId": team_id }),
            )
            .await?;
        let nodes = data["workflowStates"]["nodes"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        Ok(nodes
            .iter()
            .filter_map(|n| {
                Some(WorkflowState {
                    id: n.get("id")?.as_str()?.to_string(),
                    name: n
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                })
            })
            .collect())
    }

    async fn update_issue_state(&self, issue_id: &str, state_id: &str) -> Result<()> {
        self.execute(
            "mutation UpdateIssueState($issueId: String!, $stateId: String!) {
               issueUpdate(id: $issueId, input: { stateId: $stateId }) {
                 success
               }
             }",
            json!({ "issueId": issue_id, "stateId": state_id }),
        )
        .await?;
        Ok(())
    }
}
