use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Storefront API",
        description = "Order lifecycle core: placement with inventory \
            reservation, payment intents against the external gateway, \
            callback reconciliation and auto-cancellation of unpaid orders."
    ),
    paths(
        crate::handlers::orders::place_order,
        crate::handlers::orders::list_orders,
        crate::handlers::orders::get_order,
        crate::handlers::orders::cancel_order,
        crate::handlers::orders::confirm_receipt,
        crate::handlers::orders::request_refund,
        crate::handlers::orders::update_status,
        crate::handlers::orders::expire_order,
        crate::handlers::payments::create_payment_intent,
        crate::handlers::payment_webhooks::payment_notify,
    ),
    components(schemas(
        crate::errors::ErrorResponse,
        crate::entities::order::OrderStatus,
        crate::services::orders::PlaceOrderRequest,
        crate::services::orders::PlaceOrderItem,
        crate::services::payments::PaymentIntentResponse,
        crate::gateway::ClientPayPackage,
        crate::handlers::orders::UpdateStatusRequest,
    )),
    tags(
        (name = "Orders", description = "Order lifecycle operations"),
        (name = "Payments", description = "Payment intents and gateway notifications")
    )
)]
pub struct ApiDoc;

pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi())
}
